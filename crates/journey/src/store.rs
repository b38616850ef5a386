//! In-memory session store.
//!
//! Every mutation goes through [`SessionStore::update`], which runs the
//! closure on a copy under the entry lock and only writes it back on `Ok`.
//! That gives per-record atomicity and no partial writes on error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::types::SessionRecord;

#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<DashMap<Uuid, SessionRecord>>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new record; fails if the id is taken.
    pub fn insert(&self, record: SessionRecord) -> NurtureResult<()> {
        match self.sessions.entry(record.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(NurtureError::Conflict(format!(
                "session {} already exists",
                record.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<SessionRecord> {
        self.sessions.get(id).map(|r| r.clone())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Point-in-time copies of every record matching `predicate`.
    pub fn snapshot_where<F>(&self, predicate: F) -> Vec<SessionRecord>
    where
        F: Fn(&SessionRecord) -> bool,
    {
        self.sessions
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }

    /// Atomic read-modify-write of one record.
    pub fn update<T, F>(&self, id: &Uuid, f: F) -> NurtureResult<T>
    where
        F: FnOnce(&mut SessionRecord) -> NurtureResult<T>,
    {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or(NurtureError::SessionNotFound(*id))?;
        let mut draft = entry.clone();
        let out = f(&mut draft)?;
        *entry = draft;
        Ok(out)
    }

    /// Records an opt-out. Returns `false` if the session had already opted
    /// out.
    pub fn opt_out(&self, id: &Uuid, now: DateTime<Utc>) -> NurtureResult<bool> {
        self.update(id, |s| {
            if s.opted_out {
                return Ok(false);
            }
            s.opted_out = true;
            s.opted_out_at = Some(now);
            s.dispatch_claim = None;
            s.updated_at = now;
            Ok(true)
        })
    }

    /// Archives unpaid sessions whose last update is older than `cutoff`.
    /// Archived records keep their history; they just leave every sweep.
    pub fn archive_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut archived = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let s = entry.value_mut();
            if !s.paid && !s.archived && s.updated_at < cutoff {
                s.archived = true;
                s.dispatch_claim = None;
                s.updated_at = now;
                archived.push(s.id);
            }
        }
        if !archived.is_empty() {
            info!(count = archived.len(), %cutoff, "Archived stale sessions");
        }
        archived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use nurture_core::types::Scenario;

    fn record(now: DateTime<Utc>) -> SessionRecord {
        SessionRecord::new(Uuid::new_v4(), Some("lead@example.com".into()), now)
    }

    #[test]
    fn test_insert_rejects_duplicate_ids() {
        let store = SessionStore::new();
        let r = record(Utc::now());
        store.insert(r.clone()).unwrap();
        assert!(matches!(store.insert(r), Err(NurtureError::Conflict(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_failed_update_leaves_record_untouched() {
        let store = SessionStore::new();
        let now = Utc::now();
        let r = record(now);
        let id = r.id;
        store.insert(r).unwrap();

        let result: NurtureResult<()> = store.update(&id, |s| {
            s.stage = 5;
            s.paid = true;
            Err(NurtureError::Conflict("nope".into()))
        });
        assert!(result.is_err());

        let after = store.get(&id).unwrap();
        assert_eq!(after.stage, 0);
        assert!(!after.paid);
    }

    #[test]
    fn test_update_missing_session() {
        let store = SessionStore::new();
        let id = Uuid::new_v4();
        let err = store.update(&id, |_| Ok(())).unwrap_err();
        assert!(matches!(err, NurtureError::SessionNotFound(missing) if missing == id));
    }

    #[test]
    fn test_opt_out_is_idempotent() {
        let store = SessionStore::new();
        let r = record(Utc::now());
        let id = r.id;
        store.insert(r).unwrap();

        assert!(store.opt_out(&id, Utc::now()).unwrap());
        assert!(!store.opt_out(&id, Utc::now()).unwrap());
        assert!(store.get(&id).unwrap().opted_out);
    }

    #[test]
    fn test_archive_skips_paid_and_fresh_sessions() {
        let store = SessionStore::new();
        let now = Utc::now();

        let stale = record(now - Duration::days(10));
        let mut paid = record(now - Duration::days(10));
        paid.paid = true;
        let mut fresh = record(now);
        fresh.assign_scenario(Scenario::AbandonedFunnel, now).unwrap();

        let (stale_id, paid_id, fresh_id) = (stale.id, paid.id, fresh.id);
        for r in [stale, paid, fresh] {
            store.insert(r).unwrap();
        }

        let archived = store.archive_stale(now - Duration::days(7), now);
        assert_eq!(archived, vec![stale_id]);
        assert!(store.get(&stale_id).unwrap().archived);
        assert!(!store.get(&paid_id).unwrap().archived);
        assert!(!store.get(&fresh_id).unwrap().archived);
    }

    #[test]
    fn test_snapshot_where_filters() {
        let store = SessionStore::new();
        let now = Utc::now();
        let mut a = record(now);
        a.assign_scenario(Scenario::AbandonedCheckout, now).unwrap();
        store.insert(a).unwrap();
        store.insert(record(now)).unwrap();

        assert_eq!(store.snapshot_where(|s| s.is_schedulable()).len(), 1);
        assert_eq!(store.snapshot_where(|_| true).len(), 2);
    }
}
