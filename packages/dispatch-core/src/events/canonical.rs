//! Canonical dispatch events (§4.6) and the subscriber filter language.

use serde::Serialize;
use serde_json::Value;

/// The closed event set published through the subscriber hub.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum DispatchEvent {
    CallStart(Value),
    CallUpdate(Value),
    CallEnd(Value),
    UnitActivity(Value),
    UnitStatus(Value),
    SystemUpdate(Value),
    SystemRates(Value),
    SystemConfig(Value),
    TranscriptionNew(Value),
    AudioNew(Value),
    RecorderStateChange(Value),
    InitialState(Value),
}

impl DispatchEvent {
    /// The event-type name as it appears in the filter language and in
    /// `Counter` labels. Stable, snake_case, matches §4.6's closed set.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CallStart(_) => "call.start",
            Self::CallUpdate(_) => "call.update",
            Self::CallEnd(_) => "call.end",
            Self::UnitActivity(_) => "unit.activity",
            Self::UnitStatus(_) => "unit.status",
            Self::SystemUpdate(_) => "system.update",
            Self::SystemRates(_) => "system.rates",
            Self::SystemConfig(_) => "system.config",
            Self::TranscriptionNew(_) => "transcription.new",
            Self::AudioNew(_) => "audio.new",
            Self::RecorderStateChange(_) => "recorder.stateChange",
            Self::InitialState(_) => "initial.state",
        }
    }

    /// Extracts the fields the filter language matches against, when present
    /// on the event's payload. Absent fields never exclude an event.
    fn talkgroup(&self) -> Option<i64> {
        self.payload().get("tgid")?.as_i64()
    }

    fn system_id(&self) -> Option<i64> {
        self.payload().get("system_id")?.as_i64()
    }

    fn emergency(&self) -> bool {
        self.payload()
            .get("emergency")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn audio_format(&self) -> Option<&str> {
        self.payload().get("audio_format")?.as_str()
    }

    fn payload(&self) -> &Value {
        match self {
            Self::CallStart(v)
            | Self::CallUpdate(v)
            | Self::CallEnd(v)
            | Self::UnitActivity(v)
            | Self::UnitStatus(v)
            | Self::SystemUpdate(v)
            | Self::SystemRates(v)
            | Self::SystemConfig(v)
            | Self::TranscriptionNew(v)
            | Self::AudioNew(v)
            | Self::RecorderStateChange(v)
            | Self::InitialState(v) => v,
        }
    }
}

/// The filter a subscriber attaches when it subscribes (§4.6). All
/// constraints are conjunctive; an absent constraint never excludes.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub talkgroup_set: Option<Vec<i64>>,
    pub system_set: Option<Vec<i64>>,
    pub emergency_only: bool,
    pub audio_format: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &DispatchEvent) -> bool {
        // initial.state always bypasses the filter: it's delivered exactly
        // once, outside the live-event stream, regardless of subscription.
        if matches!(event, DispatchEvent::InitialState(_)) {
            return true;
        }

        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.type_name()) {
                return false;
            }
        }
        if let Some(tgs) = &self.talkgroup_set {
            match event.talkgroup() {
                Some(tgid) if tgs.contains(&tgid) => {}
                Some(_) => return false,
                None => {}
            }
        }
        if let Some(systems) = &self.system_set {
            match event.system_id() {
                Some(sid) if systems.contains(&sid) => {}
                Some(_) => return false,
                None => {}
            }
        }
        if self.emergency_only && !event.emergency() {
            return false;
        }
        if let Some(fmt) = &self.audio_format {
            match event.audio_format() {
                Some(actual) if actual == fmt => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initial_state_always_matches() {
        let filter = EventFilter {
            event_types: Some(vec!["call.start".into()]),
            ..Default::default()
        };
        let event = DispatchEvent::InitialState(json!({}));
        assert!(filter.matches(&event));
    }

    #[test]
    fn event_type_filter_excludes_other_types() {
        let filter = EventFilter {
            event_types: Some(vec!["call.end".into()]),
            ..Default::default()
        };
        assert!(!filter.matches(&DispatchEvent::CallStart(json!({}))));
        assert!(filter.matches(&DispatchEvent::CallEnd(json!({}))));
    }

    #[test]
    fn talkgroup_set_excludes_non_matching_tgid() {
        let filter = EventFilter {
            talkgroup_set: Some(vec![9179]),
            ..Default::default()
        };
        assert!(filter.matches(&DispatchEvent::CallStart(json!({"tgid": 9179}))));
        assert!(!filter.matches(&DispatchEvent::CallStart(json!({"tgid": 1}))));
    }

    #[test]
    fn emergency_only_excludes_non_emergency() {
        let filter = EventFilter {
            emergency_only: true,
            ..Default::default()
        };
        assert!(!filter.matches(&DispatchEvent::CallStart(json!({"emergency": false}))));
        assert!(filter.matches(&DispatchEvent::CallStart(json!({"emergency": true}))));
    }

    #[test]
    fn missing_field_never_excludes() {
        let filter = EventFilter {
            talkgroup_set: Some(vec![9179]),
            ..Default::default()
        };
        assert!(filter.matches(&DispatchEvent::SystemUpdate(json!({}))));
    }
}
