//! Projector RS-232 wire protocol
//!
//! Requests are ASCII command bodies wrapped in a fixed envelope:
//!
//! ```text
//! \r * <body> # \r
//! ```
//!
//! Responses arrive one per line as `*KEY=VALUE#`. With local echo enabled
//! the projector first repeats the request on a line starting with `>`.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Bytes before the command body
pub const FRAME_START: &[u8] = b"\r*";

/// Bytes after the command body
pub const FRAME_END: &[u8] = b"#\r";

/// Last character of every response line
pub const RESPONSE_TERMINATOR: char = '#';

/// First character of an echoed request line
pub const ECHO_MARKER: char = '>';

/// One complete request to the device, envelope included
///
/// Frames are immutable and cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DeviceCommandFrame(Bytes);

impl DeviceCommandFrame {
    /// Wrap a command body such as `pow=on` in the wire envelope
    pub fn new(body: &str) -> Self {
        let mut buf = BytesMut::with_capacity(FRAME_START.len() + body.len() + FRAME_END.len());
        buf.put_slice(FRAME_START);
        buf.put_slice(body.as_bytes());
        buf.put_slice(FRAME_END);
        Self(buf.freeze())
    }

    /// Status query for a field
    pub fn query(field: StatusField) -> Self {
        Self::new(field.query_body())
    }

    /// Raw bytes to write
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Command body without the envelope
    pub fn body(&self) -> &str {
        let inner = &self.0[FRAME_START.len()..self.0.len() - FRAME_END.len()];
        // Bodies are always built from &str
        std::str::from_utf8(inner).unwrap_or_default()
    }

    /// Length on the wire
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Frames always carry the envelope
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for DeviceCommandFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DeviceCommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceCommandFrame({:?})", self.body())
    }
}

impl fmt::Display for DeviceCommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "*{}#", self.body())
    }
}

/// Status values the projector reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusField {
    /// Model name
    ModelName,
    /// Lamp hours
    LampHours,
    /// Power state
    Power,
    /// Input source
    Source,
    /// Blank (picture mute) state
    Blank,
}

impl StatusField {
    /// All fields, in refresh order
    pub const ALL: [StatusField; 5] = [
        StatusField::ModelName,
        StatusField::LampHours,
        StatusField::Power,
        StatusField::Source,
        StatusField::Blank,
    ];

    /// Response prefix, e.g. `*POW=`
    pub fn response_prefix(&self) -> &'static str {
        match self {
            StatusField::ModelName => "*MODELNAME=",
            StatusField::LampHours => "*LTIM=",
            StatusField::Power => "*POW=",
            StatusField::Source => "*SOUR=",
            StatusField::Blank => "*BLANK=",
        }
    }

    /// Query body, e.g. `pow=?`
    pub fn query_body(&self) -> &'static str {
        match self {
            StatusField::ModelName => "modelname=?",
            StatusField::LampHours => "ltim=?",
            StatusField::Power => "pow=?",
            StatusField::Source => "sour=?",
            StatusField::Blank => "blank=?",
        }
    }

    /// Status topic suffix under the namespace base
    pub fn topic_suffix(&self) -> &'static str {
        match self {
            StatusField::ModelName => "modelname",
            StatusField::LampHours => "lamphour",
            StatusField::Power => "power",
            StatusField::Source => "source",
            StatusField::Blank => "blank",
        }
    }
}

impl fmt::Display for StatusField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic_suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_envelope() {
        let frame = DeviceCommandFrame::new("pow=on");
        assert_eq!(frame.as_bytes(), b"\r*pow=on#\r");
        assert_eq!(frame.body(), "pow=on");
        assert_eq!(frame.len(), 10);
    }

    #[test]
    fn test_query_frames() {
        assert_eq!(
            DeviceCommandFrame::query(StatusField::ModelName).as_bytes(),
            b"\r*modelname=?#\r"
        );
        assert_eq!(
            DeviceCommandFrame::query(StatusField::LampHours).as_bytes(),
            b"\r*ltim=?#\r"
        );
    }

    #[test]
    fn test_frame_display() {
        let frame = DeviceCommandFrame::new("sour=hdmi2");
        assert_eq!(frame.to_string(), "*sour=hdmi2#");
        assert_eq!(format!("{frame:?}"), "DeviceCommandFrame(\"sour=hdmi2\")");
    }

    #[test]
    fn test_refresh_order() {
        let suffixes: Vec<_> = StatusField::ALL.iter().map(|f| f.topic_suffix()).collect();
        assert_eq!(
            suffixes,
            vec!["modelname", "lamphour", "power", "source", "blank"]
        );
    }
}
