//! Command translation from bus payloads to device frames
//!
//! Every command maps to an optional "set" frame followed by a query for the
//! same attribute, so the confirmed state is republished after any change:
//!
//! | Command | Payload | Frames |
//! |---------|---------|--------|
//! | `power` | `ON` / `OFF` | `pow=on` / `pow=off`, `pow=?` |
//! | `blank` | `ON` / `OFF` | `blank=on` / `blank=off`, `blank=?` |
//! | `source` | `HDMI`, `HDMI1`, `HDMI2`, `RGB`, `USB` | `sour=...`, `sour=?` |
//!
//! Unrecognised payloads degrade to the query alone; unrecognised commands
//! produce nothing.

use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::protocol::{DeviceCommandFrame, StatusField};

/// Commands accepted on `<base>/<command>/set`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Power on/off
    Power,
    /// Input source selection
    Source,
    /// Picture blanking
    Blank,
}

impl Command {
    /// All commands
    pub const ALL: [Command; 3] = [Command::Power, Command::Source, Command::Blank];

    /// Topic segment naming this command
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Power => "power",
            Command::Source => "source",
            Command::Blank => "blank",
        }
    }

    /// Status field re-queried after this command
    pub fn status_field(&self) -> StatusField {
        match self {
            Command::Power => StatusField::Power,
            Command::Source => StatusField::Source,
            Command::Blank => StatusField::Blank,
        }
    }

    /// Body of the set frame for `payload`, if the payload is recognised
    fn set_body(&self, payload: &str) -> Option<&'static str> {
        match (self, payload) {
            (Command::Power, "ON") => Some("pow=on"),
            (Command::Power, "OFF") => Some("pow=off"),
            (Command::Blank, "ON") => Some("blank=on"),
            (Command::Blank, "OFF") => Some("blank=off"),
            (Command::Source, _) => SourceInput::from_payload(payload).map(|s| s.set_body()),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power" => Ok(Command::Power),
            "source" => Ok(Command::Source),
            "blank" => Ok(Command::Blank),
            _ => Err(()),
        }
    }
}

/// Selectable input sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceInput {
    /// First HDMI input
    Hdmi,
    /// Second HDMI input
    Hdmi2,
    /// Analog RGB (VGA)
    Rgb,
    /// USB reader
    Usb,
}

impl SourceInput {
    /// Options advertised to the hub, in display order
    pub const OPTIONS: [&'static str; 4] = ["HDMI", "HDMI2", "RGB", "USB"];

    /// Map a bus payload; `HDMI1` is an alias of `HDMI`
    pub fn from_payload(payload: &str) -> Option<Self> {
        match payload {
            "HDMI" | "HDMI1" => Some(SourceInput::Hdmi),
            "HDMI2" => Some(SourceInput::Hdmi2),
            "RGB" => Some(SourceInput::Rgb),
            "USB" => Some(SourceInput::Usb),
            _ => None,
        }
    }

    /// Body of the set frame
    pub fn set_body(&self) -> &'static str {
        match self {
            SourceInput::Hdmi => "sour=hdmi",
            SourceInput::Hdmi2 => "sour=hdmi2",
            SourceInput::Rgb => "sour=rgb",
            SourceInput::Usb => "sour=usbreader",
        }
    }
}

/// Translate a command and its raw payload into device frames
///
/// The payload is decoded lossily and must match exactly.
/// Returns an empty list for unknown commands.
pub fn translate(command: &str, payload: &[u8]) -> Vec<DeviceCommandFrame> {
    let Ok(command) = command.parse::<Command>() else {
        debug!(command, "Unknown command, ignoring");
        return Vec::new();
    };

    let text = String::from_utf8_lossy(payload);
    let text: &str = &text;

    let mut frames = Vec::with_capacity(2);
    match command.set_body(text) {
        Some(body) => frames.push(DeviceCommandFrame::new(body)),
        None => debug!(%command, payload = text, "Unrecognized payload, querying only"),
    }
    frames.push(DeviceCommandFrame::query(command.status_field()));
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(frames: &[DeviceCommandFrame]) -> Vec<&[u8]> {
        frames.iter().map(DeviceCommandFrame::as_bytes).collect()
    }

    #[test]
    fn test_power_on() {
        let frames = translate("power", b"ON");
        assert_eq!(
            wire(&frames),
            vec![b"\r*pow=on#\r".as_slice(), b"\r*pow=?#\r".as_slice()]
        );
    }

    #[test]
    fn test_power_off() {
        let frames = translate("power", b"OFF");
        assert_eq!(
            wire(&frames),
            vec![b"\r*pow=off#\r".as_slice(), b"\r*pow=?#\r".as_slice()]
        );
    }

    #[test]
    fn test_power_unknown_payload_queries_only() {
        let frames = translate("power", b"toggle");
        assert_eq!(wire(&frames), vec![b"\r*pow=?#\r".as_slice()]);
    }

    #[test]
    fn test_blank() {
        assert_eq!(
            wire(&translate("blank", b"OFF")),
            vec![b"\r*blank=off#\r".as_slice(), b"\r*blank=?#\r".as_slice()]
        );
        assert_eq!(
            wire(&translate("blank", b"ON")),
            vec![b"\r*blank=on#\r".as_slice(), b"\r*blank=?#\r".as_slice()]
        );
    }

    #[test]
    fn test_source_mapping() {
        let cases: [(&[u8], &[u8]); 5] = [
            (b"HDMI", b"\r*sour=hdmi#\r"),
            (b"HDMI1", b"\r*sour=hdmi#\r"),
            (b"HDMI2", b"\r*sour=hdmi2#\r"),
            (b"RGB", b"\r*sour=rgb#\r"),
            (b"USB", b"\r*sour=usbreader#\r"),
        ];
        for (payload, expected) in cases {
            let frames = translate("source", payload);
            assert_eq!(wire(&frames), vec![expected, b"\r*sour=?#\r".as_slice()]);
        }
    }

    #[test]
    fn test_source_bogus_queries_only() {
        assert_eq!(
            wire(&translate("source", b"BOGUS")),
            vec![b"\r*sour=?#\r".as_slice()]
        );
    }

    #[test]
    fn test_payload_with_whitespace_queries_only() {
        let frames = translate("power", b" ON\n");
        assert_eq!(wire(&frames), vec![b"\r*pow=?#\r".as_slice()]);
    }

    #[test]
    fn test_payload_is_case_sensitive() {
        assert_eq!(translate("power", b"on").len(), 1);
    }

    #[test]
    fn test_unknown_command() {
        assert!(translate("volume", b"UP").is_empty());
        assert!(translate("", b"ON").is_empty());
    }

    #[test]
    fn test_command_round_trip_names() {
        for command in Command::ALL {
            assert_eq!(command.as_str().parse::<Command>(), Ok(command));
        }
    }
}
