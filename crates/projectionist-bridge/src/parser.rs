//! Serial line parser
//!
//! Classifies one response line from the projector and derives the work it
//! causes: status lines become retained publishes, the power-on artifact
//! becomes a power query, echoes and noise become nothing.
//!
//! Classification is pure. The read loop enqueues whatever
//! [`ParsedLine::publish_request`] and [`ParsedLine::device_frame`] yield.

use std::borrow::Cow;
use tracing::{debug, trace};

use crate::bus::BusPublishRequest;
use crate::mapper::TopicMapper;
use crate::protocol::{DeviceCommandFrame, StatusField, ECHO_MARKER, RESPONSE_TERMINATOR};

/// A classified device line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// Echo of a request we sent
    Echo,
    /// Spurious line the projector emits while powering up
    PowerOnArtifact,
    /// A status report
    Status {
        /// Which value
        field: StatusField,
        /// Reported value without protocol framing
        value: String,
    },
    /// Anything else
    Unknown,
}

impl ParsedLine {
    /// Bus publish this line causes, if any
    pub fn publish_request(&self, topics: &TopicMapper) -> Option<BusPublishRequest> {
        match self {
            ParsedLine::Status { field, value } => Some(BusPublishRequest::retained(
                topics.status_topic(*field),
                value.clone(),
            )),
            _ => None,
        }
    }

    /// Device frame this line causes, if any
    pub fn device_frame(&self) -> Option<DeviceCommandFrame> {
        match self {
            ParsedLine::PowerOnArtifact => Some(DeviceCommandFrame::query(StatusField::Power)),
            _ => None,
        }
    }
}

/// Classifier for projector response lines
#[derive(Debug, Clone)]
pub struct LineParser {
    power_on_artifact: String,
}

impl LineParser {
    /// Create a parser recognising `power_on_artifact` as the warm-up quirk
    pub fn new(power_on_artifact: impl Into<String>) -> Self {
        Self {
            power_on_artifact: power_on_artifact.into(),
        }
    }

    /// Decode raw bytes permissively and strip line terminators
    ///
    /// Invalid UTF-8 is replaced, never rejected.
    pub fn decode(raw: &[u8]) -> Cow<'_, str> {
        match String::from_utf8_lossy(raw) {
            Cow::Borrowed(s) => Cow::Borrowed(s.trim_end_matches(['\r', '\n'])),
            Cow::Owned(s) => Cow::Owned(s.trim_end_matches(['\r', '\n']).to_string()),
        }
    }

    /// Classify one line; first matching rule wins
    pub fn parse(&self, line: &str) -> ParsedLine {
        if line.starts_with(ECHO_MARKER) {
            trace!(line, "Echo");
            return ParsedLine::Echo;
        }

        if line == self.power_on_artifact {
            debug!(line, "Power-on artifact, querying power state");
            return ParsedLine::PowerOnArtifact;
        }

        for field in StatusField::ALL {
            let Some(rest) = line.strip_prefix(field.response_prefix()) else {
                continue;
            };
            // Without the terminator this is a fragment cut off by a read timeout
            let Some(value) = rest.strip_suffix(RESPONSE_TERMINATOR) else {
                debug!(line, "Unterminated status line");
                return ParsedLine::Unknown;
            };
            trace!(%field, value, "Status line");
            return ParsedLine::Status {
                field,
                value: value.to_string(),
            };
        }

        debug!(line, "Unrecognized serial line");
        ParsedLine::Unknown
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_POWER_ON_ARTIFACT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;

    fn topics() -> TopicMapper {
        TopicMapper::from_config(&TopicConfig {
            prefix: "base".to_string(),
            node_id: "node".to_string(),
            object_id: "obj".to_string(),
            ..TopicConfig::default()
        })
    }

    #[test]
    fn test_power_status() {
        let parser = LineParser::default();
        for value in ["ON", "OFF", "", "weird value=#"] {
            let line = format!("*POW={value}#");
            let parsed = parser.parse(&line);
            let req = parsed.publish_request(&topics()).expect("publish");
            assert_eq!(req.topic, "base/node/obj/power");
            assert_eq!(req.payload_str(), value);
            assert!(req.retain);
            assert!(parsed.device_frame().is_none());
        }
    }

    #[test]
    fn test_model_name() {
        let parsed = LineParser::default().parse("*MODELNAME=ABC123#");
        assert_eq!(
            parsed,
            ParsedLine::Status {
                field: StatusField::ModelName,
                value: "ABC123".to_string()
            }
        );
        let req = parsed.publish_request(&topics()).unwrap();
        assert_eq!(req, BusPublishRequest::retained("base/node/obj/modelname", "ABC123"));
    }

    #[test]
    fn test_every_status_field() {
        let parser = LineParser::default();
        let cases = [
            ("*LTIM=1234#", "lamphour", "1234"),
            ("*SOUR=HDMI#", "source", "HDMI"),
            ("*BLANK=OFF#", "blank", "OFF"),
        ];
        for (line, suffix, value) in cases {
            let req = parser.parse(line).publish_request(&topics()).unwrap();
            assert_eq!(req.topic, format!("base/node/obj/{suffix}"));
            assert_eq!(req.payload_str(), value);
        }
    }

    #[test]
    fn test_unterminated_status_is_not_published() {
        let parser = LineParser::default();
        for line in ["*POW=", "*POW=O", "*LTIM=12", "*MODELNAME=ABC"] {
            let parsed = parser.parse(line);
            assert_eq!(parsed, ParsedLine::Unknown, "line {line:?}");
            assert!(parsed.publish_request(&topics()).is_none());
        }
    }

    #[test]
    fn test_echo_is_discarded() {
        let parser = LineParser::default();
        for line in [">*pow=?#", ">", ">*POW=ON#"] {
            let parsed = parser.parse(line);
            assert_eq!(parsed, ParsedLine::Echo);
            assert!(parsed.publish_request(&topics()).is_none());
            assert!(parsed.device_frame().is_none());
        }
    }

    #[test]
    fn test_power_on_artifact_queries_power() {
        let parser = LineParser::new("*Block item#");
        let parsed = parser.parse("*Block item#");
        assert_eq!(parsed, ParsedLine::PowerOnArtifact);
        assert_eq!(
            parsed.device_frame().unwrap().as_bytes(),
            b"\r*pow=?#\r"
        );
        assert!(parsed.publish_request(&topics()).is_none());
    }

    #[test]
    fn test_unknown_lines() {
        let parser = LineParser::default();
        for line in ["", "garbage", "*VOL=5#", "POW=ON#", "*pow=on#"] {
            assert_eq!(parser.parse(line), ParsedLine::Unknown, "line {line:?}");
        }
    }

    #[test]
    fn test_duplicate_lines_are_not_deduplicated() {
        let parser = LineParser::default();
        let first = parser.parse("*SOUR=RGB#").publish_request(&topics()).unwrap();
        let second = parser.parse("*SOUR=RGB#").publish_request(&topics()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_is_permissive() {
        assert_eq!(LineParser::decode(b"*POW=ON#\r\n"), "*POW=ON#");
        assert_eq!(LineParser::decode(b"*POW=\xffON#\n"), "*POW=\u{fffd}ON#");
        assert_eq!(LineParser::decode(b"\r\n"), "");
    }
}
