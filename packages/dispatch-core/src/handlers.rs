//! Handler Registry (C2): dispatches parsed records to the subsystems that
//! act on them, validating shape, counting per-type traffic, and gating raw
//! archival by topic.

use std::sync::Arc;

use base64::Engine;

use crate::audio_store::{audio_key, AudioStore};
use crate::call_state::CallStateMachine;
use crate::error::EngineResult;
use crate::events::{DispatchEvent, SubscriberHub};
use crate::identity::IdentityResolver;
use crate::metrics;
use crate::model::AlphaTagSource;
use crate::records::{Record, RecordType, UnitEventType};
use crate::transcription::{should_transcribe, TranscriptionConfig, TranscriptionQueue};
use serde_json::json;

#[derive(Debug, Clone)]
pub struct RawArchivePolicy {
    /// `None` means "allow everything not explicitly denied".
    pub allow: Option<Vec<String>>,
    pub deny: Vec<String>,
}

impl RawArchivePolicy {
    pub fn permits(&self, record_type: RecordType) -> bool {
        let name = record_type.as_str();
        if self.deny.iter().any(|d| d == name) {
            return false;
        }
        match &self.allow {
            Some(allow) => allow.iter().any(|a| a == name),
            None => true,
        }
    }
}

impl Default for RawArchivePolicy {
    fn default() -> Self {
        Self {
            allow: None,
            deny: Vec::new(),
        }
    }
}

pub struct HandlerRegistry {
    resolver: Arc<IdentityResolver>,
    call_state: Arc<CallStateMachine>,
    audio_store: Arc<dyn AudioStore>,
    transcription: Arc<TranscriptionQueue>,
    transcription_config: TranscriptionConfig,
    hub: Arc<SubscriberHub>,
    pool: sqlx::PgPool,
    raw_archive: RawArchivePolicy,
    /// Whether an STT backend is actually configured (§4.3/§4.5). When
    /// false, eligible calls are never enqueued for transcription — there
    /// is no backend to enqueue them to.
    stt_enabled: bool,
}

impl HandlerRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<IdentityResolver>,
        call_state: Arc<CallStateMachine>,
        audio_store: Arc<dyn AudioStore>,
        transcription: Arc<TranscriptionQueue>,
        transcription_config: TranscriptionConfig,
        hub: Arc<SubscriberHub>,
        pool: sqlx::PgPool,
        raw_archive: RawArchivePolicy,
        stt_enabled: bool,
    ) -> Self {
        Self {
            resolver,
            call_state,
            audio_store,
            transcription,
            transcription_config,
            hub,
            pool,
            raw_archive,
            stt_enabled,
        }
    }

    /// Dispatches one parsed record. `source` labels the ingest origin
    /// (`mqtt`, `watch`, `http`) for the per-type, per-source counter.
    pub async fn dispatch(&self, record: Record, source: &str) -> EngineResult<()> {
        let record_type = record.record_type();
        metrics::RECORDS_RECEIVED_TOTAL
            .with_label_values(&[record_type.as_str(), source])
            .inc();

        if !self.raw_archive.permits(record_type) {
            log::debug!("raw archival denied for record type {record_type:?}");
        }

        match record {
            Record::CallStart { instance_key, call, .. } => self.handle_call_start(&instance_key, &call).await,
            Record::CallsActive { instance_key, call, .. } => self.handle_call_start(&instance_key, &call).await,
            Record::CallEnd { instance_key, call, .. } => self.handle_call_end(&instance_key, &call).await,
            Record::Audio {
                instance_key,
                metadata,
                audio_wav_base64,
                audio_m4a_base64,
                ..
            } => {
                self.handle_audio(&instance_key, &metadata, audio_wav_base64, audio_m4a_base64)
                    .await
            }
            Record::Systems { instance_key, systems, .. } => self.handle_systems(&instance_key, &systems).await,
            Record::UnitEvent {
                instance_key,
                event_type,
                sys_name,
                unit,
                talkgroup,
                unit_alpha_tag,
                ..
            } => {
                self.handle_unit_event(&instance_key, event_type, &sys_name, unit, talkgroup, unit_alpha_tag.as_deref())
                    .await
            }
            Record::Rates { .. } => {
                self.hub.publish(DispatchEvent::SystemRates(json!({})));
                Ok(())
            }
            Record::Config { .. } => {
                self.hub.publish(DispatchEvent::SystemConfig(json!({})));
                Ok(())
            }
            Record::Recorder { raw, .. } | Record::Recorders { raw, .. } => {
                self.hub.publish(DispatchEvent::RecorderStateChange(raw));
                Ok(())
            }
            Record::Unknown { type_name, .. } => {
                log::debug!("unrecognized record type `{type_name}`; logged and counted, not fatal");
                metrics::RECORDS_REJECTED_TOTAL.with_label_values(&["unknown_type"]).inc();
                Ok(())
            }
        }
    }

    async fn handle_call_start(
        &self,
        instance_key: &str,
        call: &crate::records::CallEnvelope,
    ) -> EngineResult<()> {
        let (system_id, site_id) = self.resolver.resolve_site(instance_key, &call.sys_name).await?;
        let event_time = call
            .start_time
            .and_then(|t| chrono::DateTime::from_timestamp(t as i64, 0))
            .unwrap_or_else(chrono::Utc::now);

        self.resolver
            .upsert_talkgroup(system_id, call.talkgroup, None, AlphaTagSource::Observed, event_time)
            .await?;
        if let Some(unit) = call.unit {
            self.resolver
                .upsert_unit(system_id, unit, None, AlphaTagSource::Observed, "call", Some(call.talkgroup), event_time)
                .await?;
        }

        self.call_state.start(system_id, Some(site_id), call).await
    }

    async fn handle_call_end(&self, instance_key: &str, call: &crate::records::CallEnvelope) -> EngineResult<()> {
        let (system_id, _site_id) = self.resolver.resolve_site(instance_key, &call.sys_name).await?;
        self.call_state.end(system_id, call).await
    }

    async fn handle_audio(
        &self,
        instance_key: &str,
        metadata: &crate::records::AudioMetadata,
        wav_b64: Option<String>,
        m4a_b64: Option<String>,
    ) -> EngineResult<()> {
        let (system_id, _site_id) = self.resolver.resolve_site(instance_key, &metadata.short_name).await?;

        let (bytes, content_type) = match (wav_b64, m4a_b64) {
            (Some(b), _) => (decode_audio(&b)?, "audio/wav"),
            (None, Some(b)) => (decode_audio(&b)?, "audio/mp4"),
            (None, None) => {
                log::warn!("audio record for {} carried no audio payload", metadata.filename);
                metrics::RECORDS_REJECTED_TOTAL.with_label_values(&["audio_missing_payload"]).inc();
                return Ok(());
            }
        };

        let date = chrono::DateTime::from_timestamp(metadata.start_time as i64, 0)
            .unwrap_or_else(chrono::Utc::now)
            .date_naive();
        let key = audio_key(&metadata.short_name, date, &metadata.filename);
        self.audio_store.save(&key, bytes, content_type).await?;
        metrics::AUDIO_SAVED_LOCAL_TOTAL.inc();

        let (call_id, eligible) = self
            .call_state
            .audio_arrived(
                system_id,
                metadata,
                &key,
                self.transcription_config.min_duration,
                self.transcription_config.max_duration,
                self.stt_enabled,
            )
            .await?;

        let call_group_id: Option<i64> = sqlx::query_scalar("SELECT call_group_id FROM calls WHERE call_id = $1")
            .bind(&call_id)
            .fetch_optional(&self.pool)
            .await?
            .flatten();

        if eligible
            && self.stt_enabled
            && should_transcribe(
                metadata.encrypted,
                metadata.call_length,
                true,
                &self.transcription_config,
            )
        {
            self.transcription
                .enqueue(
                    call_id,
                    chrono::DateTime::from_timestamp(metadata.start_time as i64, 0).unwrap_or_else(chrono::Utc::now),
                    key,
                    call_group_id,
                    &self.pool,
                )
                .await;
        } else {
            metrics::TRANSCRIPTIONS_SKIPPED_TOTAL
                .with_label_values(&[if metadata.encrypted { "encrypted" } else { "duration_out_of_range" }])
                .inc();
        }

        Ok(())
    }

    async fn handle_systems(&self, instance_key: &str, systems: &[crate::records::SystemRecord]) -> EngineResult<()> {
        for system in systems {
            let (system_id, _site_id) = self.resolver.resolve_site(instance_key, &system.sys_name).await?;
            if let (Some(sysid), Some(wacn)) = (&system.sysid, &system.wacn) {
                self.resolver
                    .update_system_identity(system_id, sysid, wacn, &system.sys_name, &system.system_type)
                    .await?;
            }
        }
        self.hub.publish(DispatchEvent::SystemUpdate(json!({})));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_unit_event(
        &self,
        instance_key: &str,
        event_type: UnitEventType,
        sys_name: &str,
        unit: i64,
        talkgroup: Option<i64>,
        unit_alpha_tag: Option<&str>,
    ) -> EngineResult<()> {
        let (system_id, _site_id) = self.resolver.resolve_site(instance_key, sys_name).await?;
        let event_name = format!("{event_type:?}").to_lowercase();
        self.resolver
            .upsert_unit(
                system_id,
                unit,
                unit_alpha_tag,
                AlphaTagSource::Observed,
                &event_name,
                talkgroup,
                chrono::Utc::now(),
            )
            .await?;

        let payload = json!({
            "system_id": system_id,
            "unit": unit,
            "tgid": talkgroup,
            "event": event_name,
        });
        match event_type {
            UnitEventType::On | UnitEventType::Off => self.hub.publish(DispatchEvent::UnitStatus(payload)),
            _ => self.hub.publish(DispatchEvent::UnitActivity(payload)),
        }
        Ok(())
    }
}

fn decode_audio(b64: &str) -> EngineResult<bytes::Bytes> {
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map(bytes::Bytes::from)
        .map_err(|e| crate::error::EngineError::MalformedRecord(format!("invalid base64 audio payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_list_blocks_named_type() {
        let policy = RawArchivePolicy {
            allow: None,
            deny: vec!["rates".into()],
        };
        assert!(!policy.permits(RecordType::Rates));
        assert!(policy.permits(RecordType::CallStart));
    }

    #[test]
    fn allow_list_restricts_to_named_types() {
        let policy = RawArchivePolicy {
            allow: Some(vec!["call_start".into()]),
            deny: Vec::new(),
        };
        assert!(policy.permits(RecordType::CallStart));
        assert!(!policy.permits(RecordType::Audio));
    }
}
