//! Identity Resolver (C1).
//!
//! Maps heterogeneous inbound records onto the canonical (system, site,
//! talkgroup, unit) identity graph. Every write here is one logical
//! transaction; the resolver holds no lock across calls and relies on the
//! database's unique indexes as the serialization primitive.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;

use crate::error::{EngineError, EngineResult};
use crate::model::AlphaTagSource;

/// Small in-process cache short-circuiting the `resolve_site` hot path.
/// Invalidated wholesale on any merge, since merges are rare and a full
/// clear is simpler (and cheaper to reason about) than surgical eviction.
type SiteCacheKey = (String, String);

pub struct IdentityResolver {
    pool: PgPool,
    site_cache: DashMap<SiteCacheKey, (i64, i64)>,
    merge_enabled: bool,
}

impl IdentityResolver {
    pub fn new(pool: PgPool, merge_enabled: bool) -> Self {
        Self {
            pool,
            site_cache: DashMap::new(),
            merge_enabled,
        }
    }

    /// Resolve (or lazily create) the `(system_id, site_id)` pair for an
    /// `(instance_key, short_name)` observation. Idempotent: concurrent
    /// callers racing on the same pair converge on one row via an
    /// `ON CONFLICT DO UPDATE ... RETURNING` upsert.
    pub async fn resolve_site(
        &self,
        instance_key: &str,
        short_name: &str,
    ) -> EngineResult<(i64, i64)> {
        let cache_key = (instance_key.to_string(), short_name.to_string());
        if let Some(hit) = self.site_cache.get(&cache_key) {
            return Ok(*hit);
        }

        let ids = self.resolve_site_uncached(instance_key, short_name).await?;
        self.site_cache.insert(cache_key, ids);
        Ok(ids)
    }

    async fn resolve_site_uncached(
        &self,
        instance_key: &str,
        short_name: &str,
    ) -> EngineResult<(i64, i64)> {
        match self.resolve_site_tx(instance_key, short_name).await {
            Ok(ids) => Ok(ids),
            // Retry-once on unique-violation races (§4.1 Failures): another
            // writer committed the same (instance_key, short_name) between
            // our lookup and insert. Re-read rather than erroring.
            Err(EngineError::WriteConflict(_)) => {
                self.resolve_site_tx(instance_key, short_name).await
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_site_tx(
        &self,
        instance_key: &str,
        short_name: &str,
    ) -> EngineResult<(i64, i64)> {
        let mut tx = self.pool.begin().await?;

        if let Some((system_id, site_id)) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT system_id, site_id FROM sites WHERE instance_key = $1 AND short_name = $2",
        )
        .bind(instance_key)
        .bind(short_name)
        .fetch_optional(&mut *tx)
        .await?
        {
            tx.commit().await?;
            return Ok((system_id, site_id));
        }

        // A bare placeholder system is created lazily; `update_system_identity`
        // upgrades it once real sysid/wacn/type information arrives.
        let system_id: i64 = sqlx::query_scalar(
            "INSERT INTO systems (system_type, sysid, wacn, name) VALUES ('unknown', '0', '0', $1) RETURNING system_id",
        )
        .bind(short_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(d) if d.is_unique_violation()) {
                EngineError::WriteConflict(e.to_string())
            } else {
                EngineError::from(e)
            }
        })?;

        let site_id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO sites (system_id, instance_key, short_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (instance_key, short_name) DO UPDATE SET short_name = EXCLUDED.short_name
            RETURNING site_id
            ",
        )
        .bind(system_id)
        .bind(instance_key)
        .bind(short_name)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((system_id, site_id))
    }

    /// Upgrades a placeholder system's identity once real control-channel
    /// metadata arrives. Enforces the P25 sysid/wacn merge policy: if
    /// another non-deleted system already holds `(sysid, wacn)`, `system_id`
    /// is soft-deleted and every dependent row is re-pointed to the
    /// survivor in one transaction.
    pub async fn update_system_identity(
        &self,
        system_id: i64,
        sysid: &str,
        wacn: &str,
        name: &str,
        system_type: &str,
    ) -> EngineResult<i64> {
        if !self.merge_enabled || sysid == "0" || wacn == "0" {
            sqlx::query(
                "UPDATE systems SET sysid = $2, wacn = $3, name = $4, system_type = $5 WHERE system_id = $1",
            )
            .bind(system_id)
            .bind(sysid)
            .bind(wacn)
            .bind(name)
            .bind(system_type)
            .execute(&self.pool)
            .await?;
            return Ok(system_id);
        }

        let mut tx = self.pool.begin().await?;

        let survivor: Option<i64> = sqlx::query_scalar(
            "SELECT system_id FROM systems WHERE sysid = $1 AND wacn = $2 AND deleted_at IS NULL AND system_id <> $3",
        )
        .bind(sysid)
        .bind(wacn)
        .bind(system_id)
        .fetch_optional(&mut *tx)
        .await?;

        let result = match survivor {
            None => {
                sqlx::query(
                    "UPDATE systems SET sysid = $2, wacn = $3, name = $4, system_type = $5 WHERE system_id = $1",
                )
                .bind(system_id)
                .bind(sysid)
                .bind(wacn)
                .bind(name)
                .bind(system_type)
                .execute(&mut *tx)
                .await?;
                system_id
            }
            Some(survivor_id) => {
                self.merge_into(&mut tx, system_id, survivor_id).await?;
                survivor_id
            }
        };

        tx.commit().await?;
        self.site_cache.clear();
        Ok(result)
    }

    /// Re-points every dependent row from `loser` to `survivor`, then
    /// soft-deletes `loser`. §8 invariant 4: after this call, no row in any
    /// child table references `loser`.
    async fn merge_into(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        loser: i64,
        survivor: i64,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE sites SET system_id = $1 WHERE system_id = $2")
            .bind(survivor)
            .bind(loser)
            .execute(&mut **tx)
            .await?;

        // Talkgroups/units key on (system_id, tgid|unit_id); a row may
        // already exist under the survivor. Prefer the survivor's row
        // (first_seen = min across both) and drop the loser's duplicate.
        sqlx::query(
            r"
            UPDATE talkgroups AS survivor_tg
            SET first_seen = LEAST(survivor_tg.first_seen, loser_tg.first_seen)
            FROM talkgroups AS loser_tg
            WHERE loser_tg.system_id = $2
              AND survivor_tg.system_id = $1
              AND survivor_tg.tgid = loser_tg.tgid
            ",
        )
        .bind(survivor)
        .bind(loser)
        .execute(&mut **tx)
        .await?;
        sqlx::query(
            r"
            DELETE FROM talkgroups
            WHERE system_id = $2
              AND tgid IN (SELECT tgid FROM talkgroups WHERE system_id = $1)
            ",
        )
        .bind(survivor)
        .bind(loser)
        .execute(&mut **tx)
        .await?;
        sqlx::query("UPDATE talkgroups SET system_id = $1 WHERE system_id = $2")
            .bind(survivor)
            .bind(loser)
            .execute(&mut **tx)
            .await?;

        sqlx::query(
            "DELETE FROM units WHERE system_id = $2 AND unit_id IN (SELECT unit_id FROM units WHERE system_id = $1)",
        )
        .bind(survivor)
        .bind(loser)
        .execute(&mut **tx)
        .await?;
        sqlx::query("UPDATE units SET system_id = $1 WHERE system_id = $2")
            .bind(survivor)
            .bind(loser)
            .execute(&mut **tx)
            .await?;

        sqlx::query("UPDATE calls SET system_id = $1 WHERE system_id = $2")
            .bind(survivor)
            .bind(loser)
            .execute(&mut **tx)
            .await?;
        sqlx::query("UPDATE call_groups SET system_id = $1 WHERE system_id = $2")
            .bind(survivor)
            .bind(loser)
            .execute(&mut **tx)
            .await?;

        sqlx::query("UPDATE systems SET deleted_at = now() WHERE system_id = $1")
            .bind(loser)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    /// Upserts a talkgroup, enforcing source-precedence (observed < csv <
    /// manual) at the SQL layer via a `CASE` that only overwrites text
    /// fields when the incoming source is at least as strong as the
    /// existing one. `alpha_tag_source` is stored as text, so the
    /// comparison ranks each side through [`alpha_tag_rank`] rather than
    /// comparing the text lexicographically — `'observed'` would
    /// otherwise sort after `'csv'` and `'manual'`.
    pub async fn upsert_talkgroup(
        &self,
        system_id: i64,
        tgid: i64,
        alpha_tag: Option<&str>,
        source: AlphaTagSource,
        event_time: DateTime<Utc>,
    ) -> EngineResult<()> {
        let query = format!(
            r"
            INSERT INTO talkgroups (system_id, tgid, alpha_tag, alpha_tag_source, first_seen, last_seen)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (system_id, tgid) DO UPDATE SET
                alpha_tag = CASE
                    WHEN {incoming_rank} >= {existing_rank}
                        THEN COALESCE(EXCLUDED.alpha_tag, talkgroups.alpha_tag)
                    ELSE talkgroups.alpha_tag
                END,
                alpha_tag_source = CASE
                    WHEN {incoming_rank} >= {existing_rank} THEN $4
                    ELSE talkgroups.alpha_tag_source
                END,
                first_seen = LEAST(talkgroups.first_seen, $5),
                last_seen = GREATEST(talkgroups.last_seen, $5)
            ",
            incoming_rank = alpha_tag_rank("$4"),
            existing_rank = alpha_tag_rank("talkgroups.alpha_tag_source"),
        );
        sqlx::query(&query)
            .bind(system_id)
            .bind(tgid)
            .bind(alpha_tag)
            .bind(source)
            .bind(event_time)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Upserts a unit. Same source-precedence rule on `alpha_tag`;
    /// `last_event_*` only advances when `event_time >= existing`.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_unit(
        &self,
        system_id: i64,
        unit_id: i64,
        alpha_tag: Option<&str>,
        source: AlphaTagSource,
        event_type: &str,
        tgid: Option<i64>,
        event_time: DateTime<Utc>,
    ) -> EngineResult<()> {
        let query = format!(
            r"
            INSERT INTO units (system_id, unit_id, alpha_tag, alpha_tag_source, first_seen, last_seen,
                                last_event_type, last_event_time, last_event_tgid)
            VALUES ($1, $2, $3, $4, $6, $6, $5, $6, $7)
            ON CONFLICT (system_id, unit_id) DO UPDATE SET
                alpha_tag = CASE
                    WHEN {incoming_rank} >= {existing_rank}
                        THEN COALESCE(EXCLUDED.alpha_tag, units.alpha_tag)
                    ELSE units.alpha_tag
                END,
                alpha_tag_source = CASE
                    WHEN {incoming_rank} >= {existing_rank} THEN $4
                    ELSE units.alpha_tag_source
                END,
                first_seen = LEAST(units.first_seen, $6),
                last_seen = GREATEST(units.last_seen, $6),
                last_event_type = CASE WHEN $6 >= units.last_event_time THEN $5 ELSE units.last_event_type END,
                last_event_time = GREATEST(units.last_event_time, $6),
                last_event_tgid = CASE WHEN $6 >= units.last_event_time THEN $7 ELSE units.last_event_tgid END
            ",
            incoming_rank = alpha_tag_rank("$4"),
            existing_rank = alpha_tag_rank("units.alpha_tag_source"),
        );
        sqlx::query(&query)
            .bind(system_id)
            .bind(unit_id)
            .bind(alpha_tag)
            .bind(source)
            .bind(event_type)
            .bind(event_time)
            .bind(tgid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Renders a `CASE` expression mapping the text-encoded `alpha_tag_source`
/// value `expr` onto its precedence rank (observed=0, csv=1, manual=2), so
/// source-precedence comparisons never fall back to lexicographic text
/// ordering (where `'observed'` sorts after `'csv'` and `'manual'`).
fn alpha_tag_rank(expr: &str) -> String {
    format!("(CASE {expr} WHEN 'observed' THEN 0 WHEN 'csv' THEN 1 WHEN 'manual' THEN 2 END)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_distinguishes_instance_and_short_name() {
        let cache: DashMap<SiteCacheKey, (i64, i64)> = DashMap::new();
        cache.insert(("rec-1".into(), "warco".into()), (1, 1));
        cache.insert(("rec-2".into(), "warco".into()), (2, 1));
        assert_eq!(
            *cache.get(&("rec-1".to_string(), "warco".to_string())).unwrap(),
            (1, 1)
        );
        assert_eq!(
            *cache.get(&("rec-2".to_string(), "warco".to_string())).unwrap(),
            (2, 1)
        );
    }
}
