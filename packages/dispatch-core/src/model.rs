//! Canonical data-model types shared across the ingest pipeline.
//!
//! These mirror the Postgres schema row-for-row; `sqlx::FromRow` derives let
//! the resolver and call-state modules read rows directly into these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source-precedence tier for a text field that multiple ingest paths can
/// write. Stronger sources freeze the field against weaker ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum AlphaTagSource {
    Observed,
    Csv,
    Manual,
}

impl AlphaTagSource {
    /// True when `self` may overwrite a field currently sourced from `existing`.
    pub fn may_overwrite(self, existing: AlphaTagSource) -> bool {
        self >= existing
    }
}

/// A logical radio system (P25, SmartNet, conventional, ...).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct System {
    pub system_id: i64,
    pub system_type: String,
    pub sysid: String,
    pub wacn: String,
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A physical site under a system.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Site {
    pub site_id: i64,
    pub system_id: i64,
    pub instance_key: String,
    pub short_name: String,
    pub nac: Option<String>,
    pub rfss: Option<i32>,
    pub p25_site_id: Option<i32>,
    pub sys_num: Option<i32>,
}

/// A logical channel within a system.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Talkgroup {
    pub system_id: i64,
    pub tgid: i64,
    pub alpha_tag: Option<String>,
    pub tag: Option<String>,
    pub group_name: Option<String>,
    pub description: Option<String>,
    pub mode: Option<String>,
    pub priority: Option<i32>,
    pub alpha_tag_source: AlphaTagSource,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A subscriber radio within a system.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Unit {
    pub system_id: i64,
    pub unit_id: i64,
    pub alpha_tag: Option<String>,
    pub alpha_tag_source: AlphaTagSource,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_event_type: Option<String>,
    pub last_event_time: Option<DateTime<Utc>>,
    pub last_event_tgid: Option<i64>,
}

/// Call lifecycle state, per §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum CallState {
    New,
    Recording,
    AudioReady,
    Ended,
    Transcribing,
    Done,
    Purged,
}

/// A single frequency segment within a call, from `audio.metadata.freqList`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CallFrequency {
    pub call_id: String,
    pub call_start_time: DateTime<Utc>,
    pub freq: i64,
    pub pos: f64,
    pub len: f64,
    pub error_count: i32,
    pub spike_count: i32,
}

/// A single transmission segment within a call, from `audio.metadata.srcList`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CallTransmission {
    pub call_id: String,
    pub call_start_time: DateTime<Utc>,
    pub src: i64,
    pub pos: f64,
    pub emergency: bool,
    pub signal_system: Option<String>,
    pub tag: Option<String>,
}

/// A single voice transmission, the central entity of the engine.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Call {
    pub call_id: String,
    pub start_time: DateTime<Utc>,
    pub system_id: i64,
    pub site_id: Option<i64>,
    pub tgid: i64,
    pub tr_call_id: Option<String>,
    pub stop_time: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub freq: Option<i64>,
    pub call_group_id: Option<i64>,
    pub audio_file_path: Option<String>,
    pub call_filename: Option<String>,
    /// JSON-encoded list, denormalized onto the row for cheap reads.
    pub src_list: serde_json::Value,
    pub freq_list: serde_json::Value,
    pub unit_ids: serde_json::Value,
    pub encrypted: bool,
    pub emergency: bool,
    pub call_state: CallState,
    pub rec_state: String,
    pub transcription_text: Option<String>,
    pub transcription_word_count: Option<i32>,
    pub transcription_status: Option<String>,
}

impl Call {
    /// §8 invariant 1.
    pub fn stop_time_valid(&self) -> bool {
        self.stop_time.is_none_or(|stop| stop >= self.start_time)
    }

    /// §8 invariant 2: duration matches the stop/start delta within 1s.
    pub fn duration_consistent(&self) -> bool {
        match (self.stop_time, self.duration) {
            (Some(stop), Some(d)) => {
                let computed = (stop - self.start_time).num_milliseconds() as f64 / 1000.0;
                (computed - d).abs() <= 1.0
            }
            _ => true,
        }
    }

    /// §3: eligible for the stale-call sweeper.
    pub fn is_stale(&self, now: DateTime<Utc>, purge_horizon: chrono::Duration) -> bool {
        self.rec_state == "RECORDING"
            && self.audio_file_path.is_none()
            && (self.stop_time.is_none() || self.duration == Some(0.0))
            && now - self.start_time > purge_horizon
    }
}

/// A multi-site merge bucket keyed by (system_id, tgid, quantized start_time).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CallGroup {
    pub call_group_id: i64,
    pub system_id: i64,
    pub tgid: i64,
    pub bucket_start: DateTime<Utc>,
    pub primary_call_id: Option<String>,
}

/// A transcription row. At most one per call has `is_primary = true`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transcription {
    pub transcription_id: i64,
    pub call_id: String,
    pub call_start_time: DateTime<Utc>,
    pub is_primary: bool,
    pub text: String,
    pub word_count: i32,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_tag_source_ordering_is_observed_lt_csv_lt_manual() {
        assert!(AlphaTagSource::Manual.may_overwrite(AlphaTagSource::Csv));
        assert!(AlphaTagSource::Manual.may_overwrite(AlphaTagSource::Observed));
        assert!(!AlphaTagSource::Observed.may_overwrite(AlphaTagSource::Csv));
        assert!(!AlphaTagSource::Csv.may_overwrite(AlphaTagSource::Manual));
        assert!(AlphaTagSource::Observed.may_overwrite(AlphaTagSource::Observed));
    }

    fn base_call() -> Call {
        Call {
            call_id: "c1".into(),
            start_time: Utc::now(),
            system_id: 1,
            site_id: None,
            tgid: 100,
            tr_call_id: None,
            stop_time: None,
            duration: None,
            freq: None,
            call_group_id: None,
            audio_file_path: None,
            call_filename: None,
            src_list: serde_json::json!([]),
            freq_list: serde_json::json!([]),
            unit_ids: serde_json::json!([]),
            encrypted: false,
            emergency: false,
            call_state: CallState::New,
            rec_state: "RECORDING".into(),
            transcription_text: None,
            transcription_word_count: None,
            transcription_status: None,
        }
    }

    #[test]
    fn stop_time_before_start_is_invalid() {
        let mut call = base_call();
        call.stop_time = Some(call.start_time - chrono::Duration::seconds(1));
        assert!(!call.stop_time_valid());
    }

    #[test]
    fn duration_within_one_second_is_consistent() {
        let mut call = base_call();
        call.stop_time = Some(call.start_time + chrono::Duration::seconds(6));
        call.duration = Some(6.4);
        assert!(call.duration_consistent());
        call.duration = Some(8.0);
        assert!(!call.duration_consistent());
    }

    #[test]
    fn stale_requires_recording_and_no_audio_and_old_start() {
        let mut call = base_call();
        call.start_time = Utc::now() - chrono::Duration::hours(2);
        assert!(call.is_stale(Utc::now(), chrono::Duration::hours(1)));
        call.audio_file_path = Some("x".into());
        assert!(!call.is_stale(Utc::now(), chrono::Duration::hours(1)));
    }
}
