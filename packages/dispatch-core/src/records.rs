//! Inbound record envelopes (§6) and the closed record-type enumeration (§4.2).
//!
//! A [`Record`] is the canonical, already-parsed shape that every ingest
//! source (MQTT, directory watch, HTTP upload) produces. Parsing happens at
//! the edge of each ingest source; everything downstream of C2 only ever
//! sees `Record`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One frequency segment as reported in `audio.metadata.freqList`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreqListEntry {
    pub freq: i64,
    #[serde(default)]
    pub time: Option<i64>,
    pub pos: f64,
    pub len: f64,
    #[serde(default)]
    pub error_count: i32,
    #[serde(default)]
    pub spike_count: i32,
}

/// One transmission segment as reported in `audio.metadata.srcList`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrcListEntry {
    pub src: i64,
    #[serde(default)]
    pub time: Option<i64>,
    pub pos: f64,
    #[serde(default)]
    pub emergency: bool,
    #[serde(default)]
    pub signal_system: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

fn unix_seconds(ts: f64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.trunc() as i64, ((ts.fract()) * 1e9) as u32)
        .single()
        .unwrap_or_else(Utc::now)
}

/// `call_start` / `call_end` / `calls_active` share this envelope shape;
/// fields not present in a given message type are `None`.
#[derive(Debug, Clone, Deserialize)]
pub struct CallEnvelope {
    pub sys_name: String,
    #[serde(default)]
    pub sys_num: i64,
    pub talkgroup: i64,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub stop_time: Option<f64>,
    #[serde(default)]
    pub length: Option<f64>,
    #[serde(default)]
    pub elapsed: Option<f64>,
    #[serde(default)]
    pub unit: Option<i64>,
    #[serde(default)]
    pub emergency: bool,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub freq: Option<i64>,
    #[serde(default)]
    pub audio_type: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
}

/// `audio` message metadata block.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioMetadata {
    pub filename: String,
    pub talkgroup: i64,
    pub start_time: f64,
    #[serde(default)]
    pub stop_time: Option<f64>,
    #[serde(default)]
    pub call_length: Option<f64>,
    #[serde(default)]
    pub freq: Option<i64>,
    #[serde(default)]
    pub emergency: bool,
    #[serde(default)]
    pub encrypted: bool,
    pub short_name: String,
    #[serde(default, rename = "freqList")]
    pub freq_list: Vec<FreqListEntry>,
    #[serde(default, rename = "srcList")]
    pub src_list: Vec<SrcListEntry>,
    #[serde(default)]
    pub call_id: Option<String>,
}

/// Canonical, parsed inbound record. The closed enumeration from §4.2, plus
/// an `Unknown` catch-all that is logged and counted but never fatal.
#[derive(Debug, Clone)]
pub enum Record {
    CallStart {
        instance_key: String,
        timestamp: DateTime<Utc>,
        call: CallEnvelope,
    },
    CallEnd {
        instance_key: String,
        timestamp: DateTime<Utc>,
        call: CallEnvelope,
    },
    CallsActive {
        instance_key: String,
        timestamp: DateTime<Utc>,
        call: CallEnvelope,
    },
    Audio {
        instance_key: String,
        timestamp: DateTime<Utc>,
        metadata: AudioMetadata,
        audio_wav_base64: Option<String>,
        audio_m4a_base64: Option<String>,
    },
    Systems {
        instance_key: String,
        timestamp: DateTime<Utc>,
        systems: Vec<SystemRecord>,
    },
    Rates {
        instance_key: String,
        timestamp: DateTime<Utc>,
        raw: Value,
    },
    Config {
        instance_key: String,
        timestamp: DateTime<Utc>,
        raw: Value,
    },
    Recorder {
        instance_key: String,
        timestamp: DateTime<Utc>,
        raw: Value,
    },
    Recorders {
        instance_key: String,
        timestamp: DateTime<Utc>,
        raw: Value,
    },
    /// Unit-scope messages: `call`, `data`, `join`, `location`, `on`, `off`, `ackresp`.
    UnitEvent {
        instance_key: String,
        timestamp: DateTime<Utc>,
        event_type: UnitEventType,
        sys_name: String,
        unit: i64,
        talkgroup: Option<i64>,
        unit_alpha_tag: Option<String>,
    },
    Unknown {
        instance_key: String,
        type_name: String,
        raw: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitEventType {
    On,
    Off,
    Call,
    Join,
    Data,
    Location,
    Ackresp,
}

impl UnitEventType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "call" => Some(Self::Call),
            "join" => Some(Self::Join),
            "data" => Some(Self::Data),
            "location" => Some(Self::Location),
            "ackresp" => Some(Self::Ackresp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemRecord {
    pub sys_name: String,
    #[serde(default)]
    pub sys_num: i64,
    #[serde(rename = "type", default)]
    pub system_type: String,
    #[serde(default)]
    pub sysid: Option<String>,
    #[serde(default)]
    pub wacn: Option<String>,
    #[serde(default)]
    pub nac: Option<String>,
}

/// Record types recognized by the handler registry (§4.2). Kept separate
/// from [`Record`] so the registry can key a dispatch table on it without
/// matching on the full payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    CallStart,
    CallEnd,
    CallsActive,
    Audio,
    Systems,
    Rates,
    Config,
    Recorder,
    Recorders,
    Call,
    Data,
    Join,
    Location,
    On,
    Off,
    Ackresp,
    Unknown,
}

impl RecordType {
    /// Stable snake_case name, matching the wire `type` field and used in
    /// metric labels and archive-policy configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::CallStart => "call_start",
            RecordType::CallEnd => "call_end",
            RecordType::CallsActive => "calls_active",
            RecordType::Audio => "audio",
            RecordType::Systems => "systems",
            RecordType::Rates => "rates",
            RecordType::Config => "config",
            RecordType::Recorder => "recorder",
            RecordType::Recorders => "recorders",
            RecordType::Call => "call",
            RecordType::Data => "data",
            RecordType::Join => "join",
            RecordType::Location => "location",
            RecordType::On => "on",
            RecordType::Off => "off",
            RecordType::Ackresp => "ackresp",
            RecordType::Unknown => "unknown",
        }
    }
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::CallStart { .. } => RecordType::CallStart,
            Record::CallEnd { .. } => RecordType::CallEnd,
            Record::CallsActive { .. } => RecordType::CallsActive,
            Record::Audio { .. } => RecordType::Audio,
            Record::Systems { .. } => RecordType::Systems,
            Record::Rates { .. } => RecordType::Rates,
            Record::Config { .. } => RecordType::Config,
            Record::Recorder { .. } => RecordType::Recorder,
            Record::Recorders { .. } => RecordType::Recorders,
            Record::UnitEvent { event_type, .. } => match event_type {
                UnitEventType::On => RecordType::On,
                UnitEventType::Off => RecordType::Off,
                UnitEventType::Call => RecordType::Call,
                UnitEventType::Join => RecordType::Join,
                UnitEventType::Data => RecordType::Data,
                UnitEventType::Location => RecordType::Location,
                UnitEventType::Ackresp => RecordType::Ackresp,
            },
            Record::Unknown { .. } => RecordType::Unknown,
        }
    }

    pub fn instance_key(&self) -> &str {
        match self {
            Record::CallStart { instance_key, .. }
            | Record::CallEnd { instance_key, .. }
            | Record::CallsActive { instance_key, .. }
            | Record::Audio { instance_key, .. }
            | Record::Systems { instance_key, .. }
            | Record::Rates { instance_key, .. }
            | Record::Config { instance_key, .. }
            | Record::Recorder { instance_key, .. }
            | Record::Recorders { instance_key, .. }
            | Record::UnitEvent { instance_key, .. }
            | Record::Unknown { instance_key, .. } => instance_key,
        }
    }
}

/// Parses a raw MQTT-shaped JSON payload into a [`Record`].
///
/// `instance_id` comes from the payload when present, otherwise falls back
/// to `fallback_instance_key` (the ingest source's configured instance key,
/// used by the directory watcher and HTTP upload acceptor which have no
/// `instance_id` field of their own).
pub fn parse_payload(raw: &[u8], fallback_instance_key: &str) -> Result<Record, String> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| e.to_string())?;

    let type_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or("missing `type` field")?
        .to_string();

    let instance_key = value
        .get("instance_id")
        .and_then(Value::as_str)
        .unwrap_or(fallback_instance_key)
        .to_string();

    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_f64)
        .map(unix_seconds)
        .unwrap_or_else(Utc::now);

    let record = match type_name.as_str() {
        "call_start" | "call_end" | "calls_active" => {
            let call: CallEnvelope = serde_json::from_value(
                value
                    .get("call")
                    .cloned()
                    .ok_or("missing `call` object")?,
            )
            .map_err(|e| e.to_string())?;
            match type_name.as_str() {
                "call_start" => Record::CallStart {
                    instance_key,
                    timestamp,
                    call,
                },
                "call_end" => Record::CallEnd {
                    instance_key,
                    timestamp,
                    call,
                },
                _ => Record::CallsActive {
                    instance_key,
                    timestamp,
                    call,
                },
            }
        }
        "audio" => {
            let call_obj = value.get("call").ok_or("missing `call` object")?;
            let metadata: AudioMetadata = serde_json::from_value(
                call_obj
                    .get("metadata")
                    .cloned()
                    .ok_or("missing `call.metadata` object")?,
            )
            .map_err(|e| e.to_string())?;
            Record::Audio {
                instance_key,
                timestamp,
                metadata,
                audio_wav_base64: call_obj
                    .get("audio_wav_base64")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                audio_m4a_base64: call_obj
                    .get("audio_m4a_base64")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        }
        "systems" => {
            let systems: Vec<SystemRecord> = serde_json::from_value(
                value.get("systems").cloned().ok_or("missing `systems`")?,
            )
            .map_err(|e| e.to_string())?;
            Record::Systems {
                instance_key,
                timestamp,
                systems,
            }
        }
        "rates" => Record::Rates {
            instance_key,
            timestamp,
            raw: value,
        },
        "config" => Record::Config {
            instance_key,
            timestamp,
            raw: value,
        },
        "recorder" => Record::Recorder {
            instance_key,
            timestamp,
            raw: value,
        },
        "recorders" => Record::Recorders {
            instance_key,
            timestamp,
            raw: value,
        },
        other => {
            if let Some(event_type) = UnitEventType::parse(other) {
                let sys_name = value
                    .get("sys_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let unit = value.get("unit").and_then(Value::as_i64).unwrap_or(0);
                Record::UnitEvent {
                    instance_key,
                    timestamp,
                    event_type,
                    sys_name,
                    unit,
                    talkgroup: value.get("talkgroup").and_then(Value::as_i64),
                    unit_alpha_tag: value
                        .get("unit_alpha_tag")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }
            } else {
                Record::Unknown {
                    instance_key,
                    type_name: other.to_string(),
                    raw: value,
                }
            }
        }
    };

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_start() {
        let payload = br#"{
            "type": "call_start",
            "timestamp": 1737430015,
            "instance_id": "rec-1",
            "call": {"sys_name":"warco","sys_num":0,"talkgroup":9179,"start_time":1737430015,"unit":909248,"emergency":false}
        }"#;
        let record = parse_payload(payload, "fallback").expect("parse");
        assert_eq!(record.record_type(), RecordType::CallStart);
        assert_eq!(record.instance_key(), "rec-1");
        match record {
            Record::CallStart { call, .. } => {
                assert_eq!(call.sys_name, "warco");
                assert_eq!(call.talkgroup, 9179);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_audio_with_freq_and_src_lists() {
        let payload = br#"{
            "type": "audio",
            "timestamp": 1737430023,
            "instance_id": "rec-1",
            "call": {
                "metadata": {
                    "filename": "9179-1737430015.wav",
                    "talkgroup": 9179,
                    "start_time": 1737430015,
                    "stop_time": 1737430023,
                    "short_name": "warco",
                    "freqList": [{"freq": 854000000, "pos": 0, "len": 2.7, "error_count": 1, "spike_count": 0}],
                    "srcList": [{"src": 976109, "pos": 0}]
                },
                "audio_wav_base64": "AAAA"
            }
        }"#;
        let record = parse_payload(payload, "fallback").expect("parse");
        match record {
            Record::Audio { metadata, audio_wav_base64, .. } => {
                assert_eq!(metadata.short_name, "warco");
                assert_eq!(metadata.freq_list.len(), 1);
                assert_eq!(metadata.src_list.len(), 1);
                assert_eq!(audio_wav_base64.as_deref(), Some("AAAA"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unrecognized_type_becomes_unknown() {
        let payload = br#"{"type":"heartbeat","timestamp":1,"instance_id":"rec-1"}"#;
        let record = parse_payload(payload, "fallback").expect("parse");
        assert_eq!(record.record_type(), RecordType::Unknown);
    }

    #[test]
    fn missing_type_field_is_rejected() {
        let payload = br#"{"timestamp":1}"#;
        assert!(parse_payload(payload, "fallback").is_err());
    }

    #[test]
    fn falls_back_to_configured_instance_key_when_absent() {
        let payload = br#"{"type":"on","timestamp":1,"sys_name":"warco","unit":100}"#;
        let record = parse_payload(payload, "file-watch").expect("parse");
        assert_eq!(record.instance_key(), "file-watch");
    }
}
