//! Durable rotation state.
//!
//! Each scope owns one JSON file in the state directory recording which
//! combinations have been scheduled in the current cycle per vendor, plus the
//! scope's vendor cursor. Files are committed atomically
//! (write-to-tempfile-then-rename), so a killed invocation leaves the
//! previous state intact. A sibling cursor file tracks the fleet-wide
//! automatic class rotation.

pub mod lock;

pub use lock::ScopeLock;

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::Scope;

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors from the rotation-state store.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("rotation state for {scope} is locked by another invocation (waited {waited_ms} ms); retry later")]
    Conflict { scope: String, waited_ms: u64 },

    #[error("failed to persist rotation state: {0}")]
    Persistence(#[source] std::io::Error),

    #[error("corrupt rotation state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One scope's rotation record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeRecord {
    /// The vendor selected by the previous invocation, if any.
    #[serde(default)]
    pub last_vendor: Option<String>,

    /// Per vendor: combination ids already scheduled this cycle.
    #[serde(default)]
    pub scheduled: BTreeMap<String, BTreeSet<String>>,
}

impl ScopeRecord {
    /// Whether a combination was already scheduled this cycle.
    pub fn is_scheduled(&self, vendor: &str, combination_id: &str) -> bool {
        self.scheduled
            .get(vendor)
            .is_some_and(|set| set.contains(combination_id))
    }

    /// Number of combinations scheduled this cycle for a vendor.
    pub fn scheduled_count(&self, vendor: &str) -> usize {
        self.scheduled.get(vendor).map_or(0, BTreeSet::len)
    }

    /// Record a combination as scheduled.
    pub fn mark_scheduled(&mut self, vendor: &str, combination_id: &str) {
        self.scheduled
            .entry(vendor.to_string())
            .or_default()
            .insert(combination_id.to_string());
    }

    /// Clear the vendor's cycle once every eligible combination has been
    /// scheduled. Calling this on an already-empty set is a no-op.
    ///
    /// Returns true when a cycle was completed and cleared.
    pub fn reset_if_complete(&mut self, vendor: &str, eligible: &BTreeSet<String>) -> bool {
        let Some(done) = self.scheduled.get(vendor) else {
            return false;
        };
        if done.is_empty() || !eligible.iter().all(|id| done.contains(id)) {
            return false;
        }
        self.scheduled.remove(vendor);
        true
    }
}

/// Cursor for the fleet-wide automatic class rotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassCursor {
    /// The class picked by the previous automatic invocation.
    #[serde(default)]
    pub last_class: Option<String>,
}

/// File-backed store for rotation records.
pub struct StateStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl StateStore {
    /// Open (creating if needed) a state directory.
    pub fn open(dir: &Path, lock_timeout: Duration) -> StateResult<Self> {
        std::fs::create_dir_all(dir).map_err(StateError::Persistence)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            lock_timeout,
        })
    }

    fn record_path(&self, scope: &Scope) -> PathBuf {
        self.dir.join(format!("{}.json", scope.key()))
    }

    fn cursor_path(&self) -> PathBuf {
        self.dir.join("class-cursor.json")
    }

    /// Take the exclusive lock for a scope.
    ///
    /// Scopes lock independently: invocations for different scopes never
    /// contend here.
    pub fn lock(&self, scope: &Scope) -> StateResult<ScopeLock> {
        let path = self.dir.join(format!("{}.lock", scope.key()));
        ScopeLock::acquire(path, &scope.to_string(), self.lock_timeout)
    }

    /// Take the lock guarding the automatic class cursor.
    pub fn lock_cursor(&self) -> StateResult<ScopeLock> {
        let path = self.dir.join("class-cursor.lock");
        ScopeLock::acquire(path, "class-cursor", self.lock_timeout)
    }

    /// Load a scope's record; a missing file is an empty record.
    pub fn load(&self, scope: &Scope) -> StateResult<ScopeRecord> {
        read_json(&self.record_path(scope))
    }

    /// Atomically replace a scope's record.
    pub fn save(&self, scope: &Scope, record: &ScopeRecord) -> StateResult<()> {
        write_json(&self.dir, &self.record_path(scope), record)?;
        debug!(scope = %scope, "committed rotation state");
        Ok(())
    }

    /// Remove a scope's record entirely (operator reset).
    pub fn clear(&self, scope: &Scope) -> StateResult<()> {
        match std::fs::remove_file(self.record_path(scope)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StateError::Persistence(err)),
        }
    }

    /// Load the automatic class cursor.
    pub fn load_cursor(&self) -> StateResult<ClassCursor> {
        read_json(&self.cursor_path())
    }

    /// Atomically replace the automatic class cursor.
    pub fn save_cursor(&self, cursor: &ClassCursor) -> StateResult<()> {
        write_json(&self.dir, &self.cursor_path(), cursor)
    }
}

fn read_json<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> StateResult<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => return Err(StateError::Persistence(err)),
    };
    serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(dir: &Path, path: &Path, value: &T) -> StateResult<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|err| StateError::Persistence(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(StateError::Persistence)?;
    tmp.write_all(json.as_bytes())
        .map_err(StateError::Persistence)?;
    tmp.as_file().sync_all().map_err(StateError::Persistence)?;
    tmp.persist(path)
        .map_err(|err| StateError::Persistence(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path(), Duration::from_millis(50)).unwrap();
        (dir, store)
    }

    fn ids(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_missing_record_loads_as_empty() {
        let (_dir, store) = store();
        let record = store.load(&Scope::Host("unicorn".into())).unwrap();
        assert!(record.last_vendor.is_none());
        assert!(record.scheduled.is_empty());
    }

    #[test]
    fn test_record_round_trips() {
        let (_dir, store) = store();
        let scope = Scope::Host("unicorn".into());

        let mut record = ScopeRecord::default();
        record.last_vendor = Some("redhat".into());
        record.mark_scheduled("redhat", "img::LTP");
        store.save(&scope, &record).unwrap();

        let loaded = store.load(&scope).unwrap();
        assert_eq!(loaded.last_vendor.as_deref(), Some("redhat"));
        assert!(loaded.is_scheduled("redhat", "img::LTP"));
        assert!(!loaded.is_scheduled("suse", "img::LTP"));
    }

    #[test]
    fn test_reset_fires_only_when_cycle_complete() {
        let mut record = ScopeRecord::default();
        let eligible = ids(&["a::t", "b::t"]);

        record.mark_scheduled("redhat", "a::t");
        assert!(!record.reset_if_complete("redhat", &eligible));
        assert_eq!(record.scheduled_count("redhat"), 1);

        record.mark_scheduled("redhat", "b::t");
        assert!(record.reset_if_complete("redhat", &eligible));
        assert_eq!(record.scheduled_count("redhat"), 0);
    }

    #[test]
    fn test_reset_on_empty_set_is_a_noop() {
        let mut record = ScopeRecord::default();
        let eligible = ids(&["a::t"]);
        assert!(!record.reset_if_complete("redhat", &eligible));
        assert!(!record.reset_if_complete("redhat", &eligible));
        assert!(record.scheduled.is_empty());
    }

    #[test]
    fn test_scopes_do_not_share_records_or_locks() {
        let (_dir, store) = store();
        let host = Scope::Host("unicorn".into());
        let class = Scope::Class("unicorn".into());

        let mut record = ScopeRecord::default();
        record.mark_scheduled("redhat", "a::t");
        store.save(&host, &record).unwrap();
        assert!(store.load(&class).unwrap().scheduled.is_empty());

        // Same name, different mode: both locks can be held at once.
        let _host_lock = store.lock(&host).unwrap();
        let _class_lock = store.lock(&class).unwrap();
    }

    #[test]
    fn test_same_scope_lock_conflicts() {
        let (_dir, store) = store();
        let scope = Scope::Host("unicorn".into());
        let _held = store.lock(&scope).unwrap();
        assert!(matches!(
            store.lock(&scope),
            Err(StateError::Conflict { .. })
        ));
    }

    #[test]
    fn test_corrupt_record_is_reported_not_replaced() {
        let (dir, store) = store();
        let scope = Scope::Host("unicorn".into());
        std::fs::write(dir.path().join("host-unicorn.json"), "not json").unwrap();
        assert!(matches!(store.load(&scope), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn test_cursor_round_trips() {
        let (_dir, store) = store();
        assert!(store.load_cursor().unwrap().last_class.is_none());
        store
            .save_cursor(&ClassCursor {
                last_class: Some("kvm-unstable".into()),
            })
            .unwrap();
        assert_eq!(
            store.load_cursor().unwrap().last_class.as_deref(),
            Some("kvm-unstable")
        );
    }

    #[test]
    fn test_clear_removes_record_and_is_idempotent() {
        let (_dir, store) = store();
        let scope = Scope::Host("unicorn".into());
        let mut record = ScopeRecord::default();
        record.mark_scheduled("redhat", "a::t");
        store.save(&scope, &record).unwrap();

        store.clear(&scope).unwrap();
        assert!(store.load(&scope).unwrap().scheduled.is_empty());
        store.clear(&scope).unwrap();
    }
}
