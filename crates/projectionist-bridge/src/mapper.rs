//! Topic mapping for the projector bridge
//!
//! The [`TopicMapper`] owns the bridge's topic namespace. Everything the
//! bridge subscribes to or publishes lives under one base,
//! `<prefix>/<node_id>/<object_id>`, except the discovery configs which live
//! under the hub's discovery prefix.
//!
//! | Topic | Direction |
//! |-------|-----------|
//! | `<base>/<command>/set` | inbound command |
//! | `<base>/<field>` | outbound status |
//! | `<base>/LWT` | outbound availability |
//! | `<discovery>/switch/<unique_id>_power/config` | outbound discovery |
//! | `<discovery>/select/<unique_id>_source/config` | outbound discovery |

use tracing::trace;

use crate::config::TopicConfig;
use crate::protocol::StatusField;

/// Suffix of command topics
const SET_SUFFIX: &str = "set";

/// Availability topic suffix
const LWT_SUFFIX: &str = "LWT";

/// Maps between bridge concepts and MQTT topics
///
/// Built once at startup and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMapper {
    /// `<prefix>/<node_id>/<object_id>`
    base: String,
    /// Availability topic
    availability: String,
    /// Discovery prefix
    discovery_prefix: String,
    /// Unique id for discovery topics
    unique_id: String,
}

impl TopicMapper {
    /// Create from topic configuration
    pub fn from_config(config: &TopicConfig) -> Self {
        let base = format!("{}/{}/{}", config.prefix, config.node_id, config.object_id);
        let availability = format!("{base}/{LWT_SUFFIX}");
        Self {
            base,
            availability,
            discovery_prefix: config.discovery_prefix.clone(),
            unique_id: config.unique_id.clone(),
        }
    }

    /// Namespace root
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Topic a status field is published to
    pub fn status_topic(&self, field: StatusField) -> String {
        format!("{}/{}", self.base, field.topic_suffix())
    }

    /// Topic commands for `command` arrive on
    pub fn command_topic(&self, command: &str) -> String {
        format!("{}/{command}/{SET_SUFFIX}", self.base)
    }

    /// Subscription filter covering every command topic
    pub fn command_filter(&self) -> String {
        format!("{}/+/{SET_SUFFIX}", self.base)
    }

    /// Availability (LWT) topic
    pub fn availability_topic(&self) -> &str {
        &self.availability
    }

    /// Discovery config topic for the power switch
    pub fn power_discovery_topic(&self) -> String {
        format!(
            "{}/switch/{}_power/config",
            self.discovery_prefix, self.unique_id
        )
    }

    /// Discovery config topic for the source select
    pub fn source_discovery_topic(&self) -> String {
        format!(
            "{}/select/{}_source/config",
            self.discovery_prefix, self.unique_id
        )
    }

    /// Unique id used in discovery payloads
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Extract the command segment from an inbound topic
    ///
    /// Only `<base>/<command>/set` qualifies. Status topics under the base are
    /// the bridge's own publishes coming back through the subscription and
    /// return `None`, as does anything outside the namespace.
    pub fn command_for_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        let mut segments = rest.split('/');
        let command = segments.next().filter(|s| !s.is_empty())?;
        match (segments.next(), segments.next()) {
            (Some(SET_SUFFIX), None) => Some(command),
            _ => {
                trace!(topic, "Topic under base is not a command topic");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> TopicMapper {
        TopicMapper::from_config(&TopicConfig {
            prefix: "projector".to_string(),
            node_id: "den".to_string(),
            object_id: "benq".to_string(),
            unique_id: "den_benq".to_string(),
            name: "Den projector".to_string(),
            discovery_prefix: "homeassistant".to_string(),
        })
    }

    #[test]
    fn test_base_and_status_topics() {
        let mapper = mapper();
        assert_eq!(mapper.base(), "projector/den/benq");
        assert_eq!(
            mapper.status_topic(StatusField::LampHours),
            "projector/den/benq/lamphour"
        );
        assert_eq!(
            mapper.status_topic(StatusField::ModelName),
            "projector/den/benq/modelname"
        );
        assert_eq!(mapper.availability_topic(), "projector/den/benq/LWT");
    }

    #[test]
    fn test_command_topics() {
        let mapper = mapper();
        assert_eq!(mapper.command_topic("power"), "projector/den/benq/power/set");
        assert_eq!(mapper.command_filter(), "projector/den/benq/+/set");
    }

    #[test]
    fn test_discovery_topics() {
        let mapper = mapper();
        assert_eq!(
            mapper.power_discovery_topic(),
            "homeassistant/switch/den_benq_power/config"
        );
        assert_eq!(
            mapper.source_discovery_topic(),
            "homeassistant/select/den_benq_source/config"
        );
    }

    #[test]
    fn test_command_for_topic() {
        let mapper = mapper();
        assert_eq!(
            mapper.command_for_topic("projector/den/benq/power/set"),
            Some("power")
        );
        assert_eq!(
            mapper.command_for_topic("projector/den/benq/volume/set"),
            Some("volume")
        );
    }

    #[test]
    fn test_status_echo_is_not_a_command() {
        let mapper = mapper();
        assert_eq!(mapper.command_for_topic("projector/den/benq/power"), None);
        assert_eq!(mapper.command_for_topic("projector/den/benq/LWT"), None);
        assert_eq!(
            mapper.command_for_topic("projector/den/benq/power/set/extra"),
            None
        );
        assert_eq!(mapper.command_for_topic("projector/den/benq//set"), None);
    }

    #[test]
    fn test_foreign_topics_are_rejected() {
        let mapper = mapper();
        assert_eq!(mapper.command_for_topic("projector/den/epson/power/set"), None);
        assert_eq!(mapper.command_for_topic("projector/den/benqx/power/set"), None);
        assert_eq!(mapper.command_for_topic("other/topic"), None);
    }
}
