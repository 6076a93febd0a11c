//! Call State Machine (C3): owns the in-memory map of active calls and
//! drives the persistence pipeline. The hardest subsystem in the engine.
//!
//! Single-writer discipline is enforced with a `parking_lot::Mutex` guarding
//! the active map rather than a dedicated actor loop: every mutation here is
//! synchronous and short (no `.await` while holding the lock), so the mutex
//! gives the same one-mutation-at-a-time guarantee without an extra task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::events::{DispatchEvent, SubscriberHub};
use crate::metrics;
use crate::model::CallState;
use crate::records::{AudioMetadata, CallEnvelope};

const COALESCE_WINDOW_SECS: i64 = 5;

/// Composite identity tolerant of clock skew between `call_start` and the
/// later `audio` message: `start_time` is rounded to a 5-second bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ActiveKey {
    system_id: i64,
    tgid: i64,
    bucket: i64,
}

fn bucket_of(start_time: DateTime<Utc>) -> i64 {
    start_time.timestamp() / COALESCE_WINDOW_SECS
}

struct ActiveCall {
    call_id: String,
    start_time: DateTime<Utc>,
    system_id: i64,
    tgid: i64,
    tr_call_id: Option<String>,
    rec_state: String,
    call_state: CallState,
    stop_time: Option<DateTime<Utc>>,
    duration: Option<f64>,
    audio_file_path: Option<String>,
    call_group_id: Option<i64>,
    call_end_emitted: bool,
}

pub struct CallStateMachine {
    pool: PgPool,
    hub: Arc<SubscriberHub>,
    active: Mutex<HashMap<ActiveKey, ActiveCall>>,
    tr_index: Mutex<HashMap<String, ActiveKey>>,
}

impl CallStateMachine {
    pub fn new(pool: PgPool, hub: Arc<SubscriberHub>) -> Self {
        Self {
            pool,
            hub,
            active: Mutex::new(HashMap::new()),
            tr_index: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_call_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Handles `call_start`: resolves identities upstream (caller passes
    /// already-resolved `system_id`), inserts a new active call or coalesces
    /// into an existing one within the 5-second window.
    pub async fn start(
        &self,
        system_id: i64,
        site_id: Option<i64>,
        call: &CallEnvelope,
    ) -> EngineResult<()> {
        let start_time = call
            .start_time
            .map(unix_to_datetime)
            .unwrap_or_else(Utc::now);
        let key = ActiveKey {
            system_id,
            tgid: call.talkgroup,
            bucket: bucket_of(start_time),
        };

        let already_active = self.active.lock().contains_key(&key);
        if already_active {
            self.coalesce(key, call).await?;
            metrics::CALL_COALESCE_TOTAL.inc();
            return Ok(());
        }

        let call_id = call
            .call_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let unit_ids = call.unit.map(|u| vec![u]).unwrap_or_default();

        let call_group_id = self.upsert_call_group(system_id, call.talkgroup, start_time).await?;

        sqlx::query(
            r"
            INSERT INTO calls (
                call_id, start_time, system_id, site_id, tgid, tr_call_id, freq,
                unit_ids, encrypted, emergency, call_state, rec_state, call_group_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (call_id, start_time) DO NOTHING
            ",
        )
        .bind(&call_id)
        .bind(start_time)
        .bind(system_id)
        .bind(site_id)
        .bind(call.talkgroup)
        .bind(call.call_id.as_deref())
        .bind(call.freq)
        .bind(json!(unit_ids))
        .bind(call.encrypted)
        .bind(call.emergency)
        .bind(CallState::New)
        .bind("NEW")
        .bind(call_group_id)
        .execute(&self.pool)
        .await?;

        self.active.lock().insert(
            key,
            ActiveCall {
                call_id: call_id.clone(),
                start_time,
                system_id,
                tgid: call.talkgroup,
                tr_call_id: call.call_id.clone(),
                rec_state: "NEW".to_string(),
                call_state: CallState::New,
                stop_time: None,
                duration: None,
                audio_file_path: None,
                call_group_id,
                call_end_emitted: false,
            },
        );
        if let Some(tr_call_id) = &call.call_id {
            self.tr_index.lock().insert(tr_call_id.clone(), key);
        }

        metrics::CALLS_STARTED_TOTAL.inc();
        metrics::ACTIVE_CALLS.set(self.active_call_count() as i64);
        self.hub.publish(DispatchEvent::CallStart(json!({
            "call_id": call_id,
            "system_id": system_id,
            "tgid": call.talkgroup,
            "emergency": call.emergency,
        })));
        Ok(())
    }

    /// Folds a subsequent `call_start`/`calls_active` for the same composite
    /// identity into the existing active record rather than duplicating it.
    async fn coalesce(&self, key: ActiveKey, call: &CallEnvelope) -> EngineResult<()> {
        let call_id = {
            let active = self.active.lock();
            active.get(&key).map(|c| c.call_id.clone())
        };
        let Some(call_id) = call_id else {
            return Ok(());
        };

        if let Some(tr_call_id) = &call.call_id {
            let mut active = self.active.lock();
            if let Some(entry) = active.get_mut(&key) {
                entry.tr_call_id = Some(tr_call_id.clone());
            }
            drop(active);
            self.tr_index.lock().insert(tr_call_id.clone(), key);
        }

        self.apply_elapsed_update(&call_id, call.elapsed, call.length).await?;
        self.hub.publish(DispatchEvent::CallUpdate(json!({
            "call_id": call_id,
        })));
        Ok(())
    }

    /// `calls_active` may carry only `elapsed`; `stop_time`/`duration` only
    /// advance when the call isn't already finalized (duration NULL or 0).
    async fn apply_elapsed_update(
        &self,
        call_id: &str,
        elapsed: Option<f64>,
        length: Option<f64>,
    ) -> EngineResult<()> {
        let Some(duration) = length.or(elapsed) else {
            return Ok(());
        };
        sqlx::query(
            r"
            UPDATE calls SET duration = $2
            WHERE call_id = $1 AND (duration IS NULL OR duration = 0)
            ",
        )
        .bind(call_id)
        .bind(duration)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Handles an `audio` record. Matches by, in priority order: exact
    /// `tr_call_id`, composite identity within the window, then
    /// `(system_id, tgid)` within the window. No match creates an orphan
    /// call row retroactively.
    pub async fn audio_arrived(
        &self,
        system_id: i64,
        metadata: &AudioMetadata,
        audio_file_path: &str,
        min_duration: f64,
        max_duration: f64,
        stt_configured: bool,
    ) -> EngineResult<(String, bool)> {
        let start_time = unix_to_datetime(metadata.start_time);
        let stop_time = metadata.stop_time.map(unix_to_datetime);
        let duration = metadata.call_length;

        let matched_key = metadata
            .call_id
            .as_ref()
            .and_then(|id| self.tr_index.lock().get(id).copied())
            .or_else(|| {
                let key = ActiveKey {
                    system_id,
                    tgid: metadata.talkgroup,
                    bucket: bucket_of(start_time),
                };
                self.active.lock().contains_key(&key).then_some(key)
            })
            .or_else(|| self.find_by_system_tgid_window(system_id, metadata.talkgroup, start_time));

        let call_id = match matched_key {
            Some(key) => {
                let call_id = {
                    let active = self.active.lock();
                    active.get(&key).map(|c| c.call_id.clone())
                };
                call_id.unwrap_or_else(|| metadata.call_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()))
            }
            None => {
                log::warn!(
                    "audio record for system {system_id} tg {} matched no active call; creating orphan row",
                    metadata.talkgroup
                );
                metrics::RECORDS_REJECTED_TOTAL.with_label_values(&["audio_unmatched"]).inc();
                self.insert_orphan_call(system_id, metadata, start_time).await?
            }
        };

        sqlx::query(
            r"
            UPDATE calls SET
                audio_file_path = $2,
                call_filename = $3,
                stop_time = COALESCE($4, stop_time),
                duration = COALESCE($5, duration),
                freq_list = $6,
                src_list = $7,
                call_state = $8
            WHERE call_id = $1
            ",
        )
        .bind(&call_id)
        .bind(audio_file_path)
        .bind(&metadata.filename)
        .bind(stop_time)
        .bind(duration)
        .bind(json!(metadata.freq_list))
        .bind(json!(metadata.src_list))
        .bind(CallState::AudioReady)
        .execute(&self.pool)
        .await?;

        self.bulk_insert_segments(&call_id, start_time, metadata).await?;

        let should_emit_end = {
            let mut active = self.active.lock();
            if let Some(entry) = active.values_mut().find(|c| c.call_id == call_id) {
                entry.audio_file_path = Some(audio_file_path.to_string());
                entry.call_state = CallState::AudioReady;
                let already_emitted = entry.call_end_emitted;
                entry.call_end_emitted = true;
                !already_emitted
            } else {
                true
            }
        };

        self.hub.publish(DispatchEvent::AudioNew(json!({
            "call_id": call_id,
            "filename": metadata.filename,
        })));
        if should_emit_end {
            self.hub.publish(DispatchEvent::CallEnd(json!({ "call_id": call_id })));
        }

        let eligible = !metadata.encrypted
            && stt_configured
            && duration.is_some_and(|d| d >= min_duration && d <= max_duration);
        Ok((call_id, eligible))
    }

    fn find_by_system_tgid_window(
        &self,
        system_id: i64,
        tgid: i64,
        start_time: DateTime<Utc>,
    ) -> Option<ActiveKey> {
        let window = ChronoDuration::seconds(COALESCE_WINDOW_SECS);
        let active = self.active.lock();
        active
            .iter()
            .find(|(_, call)| {
                call.system_id == system_id
                    && call.tgid == tgid
                    && (call.start_time - start_time).abs() <= window
            })
            .map(|(key, _)| *key)
    }

    async fn insert_orphan_call(
        &self,
        system_id: i64,
        metadata: &AudioMetadata,
        start_time: DateTime<Utc>,
    ) -> EngineResult<String> {
        let call_id = metadata.call_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let call_group_id = self.upsert_call_group(system_id, metadata.talkgroup, start_time).await?;
        sqlx::query(
            r"
            INSERT INTO calls (call_id, start_time, system_id, tgid, freq, encrypted, emergency, call_state, rec_state, call_group_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (call_id, start_time) DO NOTHING
            ",
        )
        .bind(&call_id)
        .bind(start_time)
        .bind(system_id)
        .bind(metadata.talkgroup)
        .bind(metadata.freq)
        .bind(metadata.encrypted)
        .bind(metadata.emergency)
        .bind(CallState::New)
        .bind("NEW")
        .bind(call_group_id)
        .execute(&self.pool)
        .await?;
        Ok(call_id)
    }

    async fn bulk_insert_segments(
        &self,
        call_id: &str,
        start_time: DateTime<Utc>,
        metadata: &AudioMetadata,
    ) -> EngineResult<()> {
        for f in &metadata.freq_list {
            if let Err(e) = sqlx::query(
                r"
                INSERT INTO call_frequencies (call_id, call_start_time, freq, pos, len, error_count, spike_count)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(call_id)
            .bind(start_time)
            .bind(f.freq)
            .bind(f.pos)
            .bind(f.len)
            .bind(f.error_count)
            .bind(f.spike_count)
            .execute(&self.pool)
            .await
            {
                log::warn!("child-row insert (freq) failed for {call_id}: {e}");
            }
        }
        for s in &metadata.src_list {
            if let Err(e) = sqlx::query(
                r"
                INSERT INTO call_transmissions (call_id, call_start_time, src, pos, emergency, signal_system, tag)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(call_id)
            .bind(start_time)
            .bind(s.src)
            .bind(s.pos)
            .bind(s.emergency)
            .bind(&s.signal_system)
            .bind(&s.tag)
            .execute(&self.pool)
            .await
            {
                log::warn!("child-row insert (src) failed for {call_id}: {e}");
            }
        }
        Ok(())
    }

    /// Handles `call_end`: finalizes the row, removes it from the active
    /// map, emits `call.end` if not already emitted.
    pub async fn end(&self, system_id: i64, call: &CallEnvelope) -> EngineResult<()> {
        let start_time = call.start_time.map(unix_to_datetime).unwrap_or_else(Utc::now);
        let key = ActiveKey {
            system_id,
            tgid: call.talkgroup,
            bucket: bucket_of(start_time),
        };

        let entry = self.active.lock().remove(&key);
        let Some(entry) = entry else {
            metrics::CALLS_ENDED_TOTAL.inc();
            return Ok(());
        };
        if let Some(tr_call_id) = &entry.tr_call_id {
            self.tr_index.lock().remove(tr_call_id);
        }

        let stop_time = call.stop_time.map(unix_to_datetime).unwrap_or_else(Utc::now);
        let duration = call.length;

        sqlx::query(
            r"
            UPDATE calls SET stop_time = $2, duration = COALESCE($3, duration), call_state = $4, rec_state = 'ENDED'
            WHERE call_id = $1
            ",
        )
        .bind(&entry.call_id)
        .bind(stop_time)
        .bind(duration)
        .bind(CallState::Ended)
        .execute(&self.pool)
        .await?;

        metrics::CALLS_ENDED_TOTAL.inc();
        metrics::ACTIVE_CALLS.set(self.active_call_count() as i64);
        if !entry.call_end_emitted {
            self.hub
                .publish(DispatchEvent::CallEnd(json!({ "call_id": entry.call_id })));
        }
        Ok(())
    }

    /// Upserts the quantized call-group bucket and returns its id. The
    /// bucket's `primary_call_id` is set by the first caller to report
    /// non-empty audio (see `set_primary_if_unset`), never changed after.
    async fn upsert_call_group(
        &self,
        system_id: i64,
        tgid: i64,
        start_time: DateTime<Utc>,
    ) -> EngineResult<Option<i64>> {
        let bucket_start = unix_to_datetime((bucket_of(start_time) * COALESCE_WINDOW_SECS) as f64);
        let call_group_id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO call_groups (system_id, tgid, bucket_start)
            VALUES ($1, $2, $3)
            ON CONFLICT (system_id, tgid, bucket_start) DO UPDATE SET system_id = EXCLUDED.system_id
            RETURNING call_group_id
            ",
        )
        .bind(system_id)
        .bind(tgid)
        .bind(bucket_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(call_group_id))
    }

    /// Stale purge sweep (§4.3). Deletes calls still `RECORDING` with no
    /// audio and no finalized duration, older than `purge_horizon`; then a
    /// second pass deletes call-groups no call references.
    pub async fn purge_stale(&self, purge_horizon: ChronoDuration) -> EngineResult<u64> {
        let cutoff = Utc::now() - purge_horizon;
        let result = sqlx::query(
            r"
            DELETE FROM calls
            WHERE rec_state = 'RECORDING'
              AND audio_file_path IS NULL
              AND (stop_time IS NULL OR duration = 0)
              AND start_time < $1
            ",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            DELETE FROM call_groups
            WHERE NOT EXISTS (SELECT 1 FROM calls WHERE calls.call_group_id = call_groups.call_group_id)
            ",
        )
        .execute(&self.pool)
        .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            metrics::CALLS_PURGED_STALE_TOTAL.inc_by(purged);
        }
        Ok(purged)
    }
}

fn unix_to_datetime(ts: f64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.trunc() as i64, ((ts.fract()) * 1e9) as u32)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_of_rounds_down_to_five_second_window() {
        let t1 = Utc.timestamp_opt(1737430012, 0).unwrap();
        let t2 = Utc.timestamp_opt(1737430014, 0).unwrap();
        assert_eq!(bucket_of(t1), bucket_of(t2));
        let t3 = Utc.timestamp_opt(1737430016, 0).unwrap();
        assert_ne!(bucket_of(t1), bucket_of(t3));
    }

    #[test]
    fn active_key_equality_requires_all_three_fields() {
        let a = ActiveKey { system_id: 1, tgid: 100, bucket: 5 };
        let b = ActiveKey { system_id: 1, tgid: 100, bucket: 5 };
        let c = ActiveKey { system_id: 1, tgid: 101, bucket: 5 };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
