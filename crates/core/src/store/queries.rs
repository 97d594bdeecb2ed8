//! Typed query helpers for every table in the GitMirror store.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Row};
use tracing::debug;
use uuid::Uuid;

use super::Store;
use crate::errors::StoreError;
use crate::models::{Lease, Mirror, MirrorSpec, MirrorStatus, Outcome, Stage, SyncAttempt, Trigger};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamp so lexicographic comparison in SQL matches
/// chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_ts_opt(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

const MIRROR_COLUMNS: &str = "id, name, upstream_url, downstream_owner, downstream_name, enabled, \
     sync_interval_secs, priority, last_attempt_at, last_success_at, last_status, \
     last_error_summary, size_mb, created_at, updated_at";

fn mirror_from_row(row: &Row<'_>) -> rusqlite::Result<Mirror> {
    Ok(Mirror {
        id: row.get(0)?,
        name: row.get(1)?,
        upstream_url: row.get(2)?,
        downstream_owner: row.get(3)?,
        downstream_name: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        sync_interval_secs: row.get::<_, Option<i64>>(6)?.map(|v| v.max(0) as u64),
        priority: row.get(7)?,
        last_attempt_at: parse_ts_opt(8, row.get(8)?)?,
        last_success_at: parse_ts_opt(9, row.get(9)?)?,
        last_status: MirrorStatus::from_str_val(&row.get::<_, String>(10)?),
        last_error_summary: row.get(11)?,
        size_mb: row.get(12)?,
        created_at: parse_ts(13, &row.get::<_, String>(13)?)?,
        updated_at: parse_ts(14, &row.get::<_, String>(14)?)?,
    })
}

const ATTEMPT_COLUMNS: &str = "id, mirror_id, trigger_kind, outcome, stage_reached, error_class, \
     error_detail, bytes_transferred, refs_updated, started_at, finished_at";

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<SyncAttempt> {
    Ok(SyncAttempt {
        id: row.get(0)?,
        mirror_id: row.get(1)?,
        trigger: Trigger::from_str_val(&row.get::<_, String>(2)?),
        outcome: row
            .get::<_, Option<String>>(3)?
            .map(|s| Outcome::from_str_val(&s)),
        stage_reached: Stage::from_str_val(&row.get::<_, String>(4)?),
        error_class: row.get(5)?,
        error_detail: row.get(6)?,
        bytes_transferred: row.get::<_, i64>(7)?.max(0) as u64,
        refs_updated: row.get::<_, i64>(8)?.max(0) as u64,
        started_at: parse_ts(9, &row.get::<_, String>(9)?)?,
        finished_at: parse_ts_opt(10, row.get(10)?)?,
    })
}

// ---------------------------------------------------------------------------
// Filters and completion records
// ---------------------------------------------------------------------------

/// Filter for [`Store::list_mirrors`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorFilter {
    pub enabled_only: bool,
}

/// How a worker finished with a mirror when releasing its lease.
///
/// The status update and the lease deletion happen in one transaction so an
/// observer never sees `running` without a live lease or vice versa.
#[derive(Debug, Clone)]
pub enum LeaseCompletion {
    /// Attempt succeeded: status becomes `success`, error summary cleared.
    Success { at: DateTime<Utc> },
    /// Attempt failed or timed out: status becomes `failed`.
    Failed { summary: String },
    /// Attempt was cancelled or never ran: restore the pre-acquire status.
    Abandoned,
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Store {
    // -- mirrors ------------------------------------------------------------

    /// Insert a mirror, or update its configurable fields if one already
    /// exists for the same `(downstream_owner, downstream_name)` target.
    /// Status fields are owned by the engine and untouched here.
    pub fn upsert_mirror(&self, spec: &MirrorSpec) -> Result<Mirror, StoreError> {
        let now = ts(Utc::now());
        let id = self.transaction(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM mirrors WHERE downstream_owner = ?1 AND downstream_name = ?2",
                    params![spec.downstream_owner, spec.downstream_name],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    e => Err(StoreError::Sqlite(e)),
                })?;

            match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE mirrors
                         SET name = ?2, upstream_url = ?3, enabled = ?4,
                             sync_interval_secs = ?5, priority = ?6, updated_at = ?7
                         WHERE id = ?1",
                        params![
                            id,
                            spec.name,
                            spec.upstream_url,
                            spec.enabled as i64,
                            spec.sync_interval_secs.map(|v| v as i64),
                            spec.priority,
                            now,
                        ],
                    )?;
                    Ok(id)
                }
                None => {
                    let id = Uuid::new_v4().to_string();
                    conn.execute(
                        "INSERT INTO mirrors
                         (id, name, upstream_url, downstream_owner, downstream_name, enabled,
                          sync_interval_secs, priority, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                        params![
                            id,
                            spec.name,
                            spec.upstream_url,
                            spec.downstream_owner,
                            spec.downstream_name,
                            spec.enabled as i64,
                            spec.sync_interval_secs.map(|v| v as i64),
                            spec.priority,
                            now,
                        ],
                    )?;
                    Ok(id)
                }
            }
        })?;

        self.get_mirror(&id)?.ok_or(StoreError::NotFound {
            entity: "mirror",
            id,
        })
    }

    pub fn get_mirror(&self, id: &str) -> Result<Option<Mirror>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {MIRROR_COLUMNS} FROM mirrors WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id], mirror_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_mirrors(&self, filter: MirrorFilter) -> Result<Vec<Mirror>, StoreError> {
        let conn = self.conn();
        let sql = if filter.enabled_only {
            format!("SELECT {MIRROR_COLUMNS} FROM mirrors WHERE enabled = 1 ORDER BY name")
        } else {
            format!("SELECT {MIRROR_COLUMNS} FROM mirrors ORDER BY name")
        };
        let mut stmt = conn.prepare(&sql)?;
        let mirrors = stmt
            .query_map([], mirror_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mirrors)
    }

    /// Delete a mirror. History rows and any lease cascade with it; the
    /// caller is responsible for removing the local clone directory.
    pub fn delete_mirror(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM mirrors WHERE id = ?1", params![id])?;
        debug!(id, deleted, "deleted mirror");
        Ok(deleted > 0)
    }

    pub fn update_mirror_size(&self, id: &str, size_mb: f64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE mirrors SET size_mb = ?2 WHERE id = ?1",
            params![id, size_mb],
        )?;
        Ok(())
    }

    // -- sync_attempts ------------------------------------------------------

    /// Record the start of an attempt and stamp the mirror's
    /// `last_attempt_at` in the same transaction.
    pub fn begin_attempt(&self, mirror_id: &str, trigger: Trigger) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = ts(Utc::now());
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO sync_attempts (id, mirror_id, trigger_kind, started_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, mirror_id, trigger.to_string(), now],
            )?;
            conn.execute(
                "UPDATE mirrors SET last_attempt_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![mirror_id, now],
            )?;
            Ok(())
        })?;
        debug!(attempt_id = %id, mirror_id, %trigger, "began sync attempt");
        Ok(id)
    }

    /// Record the furthest stage entered. No-op once the attempt is final.
    pub fn advance_attempt_stage(&self, attempt_id: &str, stage: Stage) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE sync_attempts SET stage_reached = ?2 WHERE id = ?1 AND outcome IS NULL",
            params![attempt_id, stage.to_string()],
        )?;
        Ok(())
    }

    /// Finalize an attempt. At most once: returns `false` (and changes
    /// nothing) when the attempt is already final, keeping history
    /// append-only.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_attempt(
        &self,
        attempt_id: &str,
        outcome: Outcome,
        error_class: Option<&str>,
        error_detail: Option<&str>,
        bytes_transferred: u64,
        refs_updated: u64,
    ) -> Result<bool, StoreError> {
        let now = ts(Utc::now());
        let updated = self.conn().execute(
            "UPDATE sync_attempts
             SET outcome = ?2, error_class = ?3, error_detail = ?4,
                 bytes_transferred = ?5, refs_updated = ?6,
                 finished_at = MAX(?7, started_at)
             WHERE id = ?1 AND outcome IS NULL",
            params![
                attempt_id,
                outcome.to_string(),
                error_class,
                error_detail,
                bytes_transferred as i64,
                refs_updated as i64,
                now,
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn get_attempt(&self, attempt_id: &str) -> Result<Option<SyncAttempt>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM sync_attempts WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![attempt_id], attempt_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Recent attempts, newest first; global when `mirror_id` is `None`.
    pub fn recent_history(
        &self,
        mirror_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<SyncAttempt>, StoreError> {
        let conn = self.conn();
        let attempts = match mirror_id {
            Some(mirror_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM sync_attempts
                     WHERE mirror_id = ?1 ORDER BY started_at DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![mirror_id, limit], attempt_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM sync_attempts
                     ORDER BY started_at DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], attempt_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(attempts)
    }

    // -- mirror_leases ------------------------------------------------------

    /// Try to acquire the per-mirror lease.
    ///
    /// Atomic compare-and-set: expired leases are stolen, a live lease means
    /// refusal. On success the mirror's previous status is recorded in the
    /// lease row and `last_status` flips to `running` in the same
    /// transaction.
    pub fn acquire_lease(
        &self,
        mirror_id: &str,
        holder_id: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let now_s = ts(now);
        let expires_s = ts(now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)));

        self.transaction(|conn| {
            conn.execute(
                "DELETE FROM mirror_leases WHERE mirror_id = ?1 AND expires_at <= ?2",
                params![mirror_id, now_s],
            )?;

            let live: i64 = conn.query_row(
                "SELECT COUNT(*) FROM mirror_leases WHERE mirror_id = ?1",
                params![mirror_id],
                |row| row.get(0),
            )?;
            if live > 0 {
                return Ok(false);
            }

            let prev_status: String = match conn.query_row(
                "SELECT last_status FROM mirrors WHERE id = ?1",
                params![mirror_id],
                |row| row.get(0),
            ) {
                Ok(status) => status,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(false),
                Err(e) => return Err(StoreError::Sqlite(e)),
            };

            conn.execute(
                "INSERT INTO mirror_leases (mirror_id, holder_id, prev_status, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![mirror_id, holder_id, prev_status, now_s, expires_s],
            )?;
            conn.execute(
                "UPDATE mirrors SET last_status = 'running', updated_at = ?2 WHERE id = ?1",
                params![mirror_id, now_s],
            )?;
            Ok(true)
        })
    }

    /// Release a lease held by `holder_id`, writing the final mirror status
    /// in the same transaction. Returns `false` without touching the mirror
    /// when the lease was already stolen or expired away.
    pub fn release_lease(
        &self,
        mirror_id: &str,
        holder_id: &str,
        completion: &LeaseCompletion,
    ) -> Result<bool, StoreError> {
        let now_s = ts(Utc::now());
        self.transaction(|conn| {
            let prev_status: String = match conn.query_row(
                "SELECT prev_status FROM mirror_leases WHERE mirror_id = ?1 AND holder_id = ?2",
                params![mirror_id, holder_id],
                |row| row.get(0),
            ) {
                Ok(status) => status,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(false),
                Err(e) => return Err(StoreError::Sqlite(e)),
            };

            conn.execute(
                "DELETE FROM mirror_leases WHERE mirror_id = ?1 AND holder_id = ?2",
                params![mirror_id, holder_id],
            )?;

            match completion {
                LeaseCompletion::Success { at } => {
                    conn.execute(
                        "UPDATE mirrors
                         SET last_status = 'success', last_success_at = ?2,
                             last_error_summary = NULL, updated_at = ?3
                         WHERE id = ?1",
                        params![mirror_id, ts(*at), now_s],
                    )?;
                }
                LeaseCompletion::Failed { summary } => {
                    conn.execute(
                        "UPDATE mirrors
                         SET last_status = 'failed', last_error_summary = ?2, updated_at = ?3
                         WHERE id = ?1",
                        params![mirror_id, summary, now_s],
                    )?;
                }
                LeaseCompletion::Abandoned => {
                    conn.execute(
                        "UPDATE mirrors SET last_status = ?2, updated_at = ?3 WHERE id = ?1",
                        params![mirror_id, prev_status, now_s],
                    )?;
                }
            }
            Ok(true)
        })
    }

    /// Whether a non-expired lease exists for the mirror.
    pub fn lease_live(&self, mirror_id: &str) -> Result<bool, StoreError> {
        let now_s = ts(Utc::now());
        let live: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM mirror_leases WHERE mirror_id = ?1 AND expires_at > ?2",
            params![mirror_id, now_s],
            |row| row.get(0),
        )?;
        Ok(live > 0)
    }

    /// Current lease row, expired or not (diagnostics and tests).
    pub fn get_lease(&self, mirror_id: &str) -> Result<Option<Lease>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT mirror_id, holder_id, prev_status, acquired_at, expires_at
             FROM mirror_leases WHERE mirror_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![mirror_id], |row| {
            Ok(Lease {
                mirror_id: row.get(0)?,
                holder_id: row.get(1)?,
                prev_status: MirrorStatus::from_str_val(&row.get::<_, String>(2)?),
                acquired_at: parse_ts(3, &row.get::<_, String>(3)?)?,
                expires_at: parse_ts(4, &row.get::<_, String>(4)?)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // -- planning -----------------------------------------------------------

    /// Enabled mirrors whose effective interval has elapsed and which have no
    /// live lease, ordered by priority then staleness.
    pub fn due_mirrors(
        &self,
        default_interval: std::time::Duration,
    ) -> Result<Vec<Mirror>, StoreError> {
        let now_s = ts(Utc::now());
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MIRROR_COLUMNS} FROM mirrors m
             WHERE m.enabled = 1
               AND NOT EXISTS (
                   SELECT 1 FROM mirror_leases l
                   WHERE l.mirror_id = m.id AND l.expires_at > ?1
               )
               AND (m.last_attempt_at IS NULL
                    OR (julianday(?1) - julianday(m.last_attempt_at)) * 86400.0
                       >= COALESCE(m.sync_interval_secs, ?2))
             ORDER BY m.priority DESC, COALESCE(m.last_attempt_at, '') ASC"
        ))?;
        let mirrors = stmt
            .query_map(
                params![now_s, default_interval.as_secs() as i64],
                mirror_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mirrors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store() -> Store {
        let store = Store::in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    fn spec(name: &str, owner: &str) -> MirrorSpec {
        MirrorSpec {
            name: name.to_string(),
            upstream_url: format!("https://github.com/acme/{name}.git"),
            downstream_owner: owner.to_string(),
            downstream_name: name.to_string(),
            enabled: true,
            sync_interval_secs: None,
            priority: 0,
        }
    }

    #[test]
    fn test_upsert_inserts_then_updates() {
        let store = store();
        let m1 = store.upsert_mirror(&spec("demo", "")).unwrap();
        assert_eq!(m1.last_status, MirrorStatus::Never);

        let mut updated = spec("demo", "");
        updated.priority = 5;
        updated.upstream_url = "https://github.com/acme/renamed.git".into();
        let m2 = store.upsert_mirror(&updated).unwrap();

        assert_eq!(m1.id, m2.id, "same target must keep the same id");
        assert_eq!(m2.priority, 5);
        assert_eq!(m2.upstream_url, "https://github.com/acme/renamed.git");
        assert_eq!(store.list_mirrors(MirrorFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_same_name_different_owner_is_distinct() {
        let store = store();
        store.upsert_mirror(&spec("demo", "")).unwrap();
        store.upsert_mirror(&spec("demo", "org1")).unwrap();
        assert_eq!(store.list_mirrors(MirrorFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_lease_single_acquire() {
        let store = store();
        let m = store.upsert_mirror(&spec("demo", "")).unwrap();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lease(&m.id, "w1", ttl).unwrap());
        assert!(!store.acquire_lease(&m.id, "w2", ttl).unwrap());
        assert!(!store.acquire_lease(&m.id, "w1", ttl).unwrap());
    }

    #[test]
    fn test_status_lease_consistency() {
        let store = store();
        let m = store.upsert_mirror(&spec("demo", "")).unwrap();
        let ttl = Duration::from_secs(60);

        // Before: no lease, not running.
        assert!(!store.lease_live(&m.id).unwrap());
        assert_ne!(store.get_mirror(&m.id).unwrap().unwrap().last_status, MirrorStatus::Running);

        // Held: lease live iff running.
        store.acquire_lease(&m.id, "w1", ttl).unwrap();
        assert!(store.lease_live(&m.id).unwrap());
        assert_eq!(
            store.get_mirror(&m.id).unwrap().unwrap().last_status,
            MirrorStatus::Running
        );

        // Released: both gone, atomically.
        store
            .release_lease(&m.id, "w1", &LeaseCompletion::Success { at: Utc::now() })
            .unwrap();
        assert!(!store.lease_live(&m.id).unwrap());
        let m = store.get_mirror(&m.id).unwrap().unwrap();
        assert_eq!(m.last_status, MirrorStatus::Success);
        assert!(m.last_success_at.is_some());
        assert!(m.last_error_summary.is_none());
    }

    #[test]
    fn test_expired_lease_is_stolen() {
        let store = store();
        let m = store.upsert_mirror(&spec("demo", "")).unwrap();

        assert!(store.acquire_lease(&m.id, "w1", Duration::ZERO).unwrap());
        // w1's lease expired immediately; w2 may steal it.
        assert!(store.acquire_lease(&m.id, "w2", Duration::from_secs(60)).unwrap());

        // The loser's release must not clobber the thief's state.
        assert!(!store
            .release_lease(&m.id, "w1", &LeaseCompletion::Abandoned)
            .unwrap());
        assert_eq!(
            store.get_mirror(&m.id).unwrap().unwrap().last_status,
            MirrorStatus::Running
        );
    }

    #[test]
    fn test_release_abandoned_restores_prev_status() {
        let store = store();
        let m = store.upsert_mirror(&spec("demo", "")).unwrap();
        let ttl = Duration::from_secs(60);

        store.acquire_lease(&m.id, "w1", ttl).unwrap();
        store
            .release_lease(&m.id, "w1", &LeaseCompletion::Success { at: Utc::now() })
            .unwrap();

        // Cancelled attempt: status reverts to the last persisted value.
        store.acquire_lease(&m.id, "w2", ttl).unwrap();
        store
            .release_lease(&m.id, "w2", &LeaseCompletion::Abandoned)
            .unwrap();
        assert_eq!(
            store.get_mirror(&m.id).unwrap().unwrap().last_status,
            MirrorStatus::Success
        );
    }

    #[test]
    fn test_failed_release_sets_summary() {
        let store = store();
        let m = store.upsert_mirror(&spec("demo", "")).unwrap();

        store.acquire_lease(&m.id, "w1", Duration::from_secs(60)).unwrap();
        store
            .release_lease(
                &m.id,
                "w1",
                &LeaseCompletion::Failed {
                    summary: "transient network failure".into(),
                },
            )
            .unwrap();
        let m = store.get_mirror(&m.id).unwrap().unwrap();
        assert_eq!(m.last_status, MirrorStatus::Failed);
        assert_eq!(m.last_error_summary.as_deref(), Some("transient network failure"));
    }

    #[test]
    fn test_finalize_attempt_at_most_once() {
        let store = store();
        let m = store.upsert_mirror(&spec("demo", "")).unwrap();
        let attempt_id = store.begin_attempt(&m.id, Trigger::Manual).unwrap();
        store.advance_attempt_stage(&attempt_id, Stage::Fetch).unwrap();

        assert!(store
            .finalize_attempt(&attempt_id, Outcome::Success, None, None, 10, 2)
            .unwrap());
        // Second finalize is refused and changes nothing.
        assert!(!store
            .finalize_attempt(&attempt_id, Outcome::Failed, Some("unknown"), None, 0, 0)
            .unwrap());

        let attempt = store.get_attempt(&attempt_id).unwrap().unwrap();
        assert_eq!(attempt.outcome, Some(Outcome::Success));
        assert_eq!(attempt.stage_reached, Stage::Fetch);
        assert_eq!(attempt.bytes_transferred, 10);
        assert!(attempt.finished_at.unwrap() >= attempt.started_at);
    }

    #[test]
    fn test_stage_not_advanced_after_finalize() {
        let store = store();
        let m = store.upsert_mirror(&spec("demo", "")).unwrap();
        let attempt_id = store.begin_attempt(&m.id, Trigger::Scheduled).unwrap();
        store
            .finalize_attempt(&attempt_id, Outcome::Cancelled, None, None, 0, 0)
            .unwrap();
        store.advance_attempt_stage(&attempt_id, Stage::Push).unwrap();
        let attempt = store.get_attempt(&attempt_id).unwrap().unwrap();
        assert_eq!(attempt.stage_reached, Stage::Init);
    }

    #[test]
    fn test_begin_attempt_stamps_last_attempt() {
        let store = store();
        let m = store.upsert_mirror(&spec("demo", "")).unwrap();
        assert!(m.last_attempt_at.is_none());
        store.begin_attempt(&m.id, Trigger::Scheduled).unwrap();
        assert!(store
            .get_mirror(&m.id)
            .unwrap()
            .unwrap()
            .last_attempt_at
            .is_some());
    }

    #[test]
    fn test_recent_history_scoped_and_ordered() {
        let store = store();
        let m1 = store.upsert_mirror(&spec("one", "")).unwrap();
        let m2 = store.upsert_mirror(&spec("two", "")).unwrap();
        for _ in 0..3 {
            let id = store.begin_attempt(&m1.id, Trigger::Scheduled).unwrap();
            store
                .finalize_attempt(&id, Outcome::Success, None, None, 0, 0)
                .unwrap();
        }
        store.begin_attempt(&m2.id, Trigger::Manual).unwrap();

        assert_eq!(store.recent_history(Some(&m1.id), 10).unwrap().len(), 3);
        assert_eq!(store.recent_history(Some(&m1.id), 2).unwrap().len(), 2);
        assert_eq!(store.recent_history(None, 10).unwrap().len(), 4);
    }

    #[test]
    fn test_delete_mirror_cascades() {
        let store = store();
        let m = store.upsert_mirror(&spec("demo", "")).unwrap();
        let attempt_id = store.begin_attempt(&m.id, Trigger::Manual).unwrap();
        store.acquire_lease(&m.id, "w1", Duration::from_secs(60)).unwrap();

        assert!(store.delete_mirror(&m.id).unwrap());
        assert!(store.get_attempt(&attempt_id).unwrap().is_none());
        assert!(store.get_lease(&m.id).unwrap().is_none());
        assert!(!store.delete_mirror(&m.id).unwrap());
    }

    #[test]
    fn test_due_mirrors_selection() {
        let store = store();
        let interval = Duration::from_secs(3600);

        // Never attempted: due immediately.
        let fresh = store.upsert_mirror(&spec("fresh", "")).unwrap();

        // Disabled: never due.
        let mut disabled = spec("disabled", "");
        disabled.enabled = false;
        store.upsert_mirror(&disabled).unwrap();

        // Recently attempted: not due.
        let recent = store.upsert_mirror(&spec("recent", "")).unwrap();
        store.begin_attempt(&recent.id, Trigger::Scheduled).unwrap();

        // Leased: not due even if stale.
        let leased = store.upsert_mirror(&spec("leased", "")).unwrap();
        store
            .acquire_lease(&leased.id, "w1", Duration::from_secs(60))
            .unwrap();

        let due = store.due_mirrors(interval).unwrap();
        let ids: Vec<&str> = due.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![fresh.id.as_str()]);
    }

    #[test]
    fn test_due_mirrors_priority_order() {
        let store = store();
        let mut low = spec("low", "");
        low.priority = -1;
        let mut high = spec("high", "");
        high.priority = 1;
        store.upsert_mirror(&low).unwrap();
        store.upsert_mirror(&high).unwrap();

        let due = store.due_mirrors(Duration::from_secs(60)).unwrap();
        assert_eq!(due[0].name, "high");
        assert_eq!(due[1].name, "low");
    }

    #[test]
    fn test_per_mirror_interval_override() {
        let store = store();
        let mut quick = spec("quick", "");
        quick.sync_interval_secs = Some(0);
        let quick = store.upsert_mirror(&quick).unwrap();
        store.begin_attempt(&quick.id, Trigger::Scheduled).unwrap();

        // Global interval is an hour, but the override makes it due at once.
        let due = store.due_mirrors(Duration::from_secs(3600)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, quick.id);
    }
}
