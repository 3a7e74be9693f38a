//! StateStore — redb-backed state persistence for DroneGrid.
//!
//! Provides typed fetch/save operations over hosts, labels, atomic groups,
//! jobs, host queue entries and special tasks. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Closure turning a redb or serde_json error into a [`StateError`].
macro_rules! map_err {
    (encode) => {
        |e| StateError::Codec {
            op: "encode",
            message: e.to_string(),
        }
    };
    (decode) => {
        |e| StateError::Codec {
            op: "decode",
            message: e.to_string(),
        }
    };
    ($op:ident) => {
        |e| StateError::Storage {
            op: stringify!($op),
            message: e.to_string(),
        }
    };
}

type RecordTable = TableDefinition<'static, u64, &'static [u8]>;

/// A row type stored in one of the id-keyed record tables.
trait Record: Serialize + DeserializeOwned {
    const KIND: &'static str;
    const TABLE: RecordTable;

    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
}

macro_rules! record {
    ($ty:ty, $kind:literal, $table:ident) => {
        impl Record for $ty {
            const KIND: &'static str = $kind;
            const TABLE: RecordTable = $table;

            fn id(&self) -> u64 {
                self.id
            }

            fn set_id(&mut self, id: u64) {
                self.id = id;
            }
        }
    };
}

record!(Host, "host", HOSTS);
record!(Label, "label", LABELS);
record!(AtomicGroup, "atomic_group", ATOMIC_GROUPS);
record!(Job, "job", JOBS);
record!(HostQueueEntry, "host_queue_entry", QUEUE_ENTRIES);
record!(SpecialTask, "special_task", SPECIAL_TASKS);

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [HOSTS, LABELS, ATOMIC_GROUPS, JOBS, QUEUE_ENTRIES, SPECIAL_TASKS] {
            txn.open_table(table).map_err(map_err!(table))?;
        }
        txn.open_table(COUNTERS).map_err(map_err!(table))?;
        txn.commit().map_err(map_err!(transaction))?;
        Ok(())
    }

    // ── Generic record access ──────────────────────────────────────

    /// Upsert records under their current ids, all in one transaction.
    fn put_all<T: Record>(&self, records: &[T]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(transaction))?;
        {
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(table))?;
            for record in records {
                let value = serde_json::to_vec(record).map_err(map_err!(encode))?;
                table
                    .insert(record.id(), value.as_slice())
                    .map_err(map_err!(write))?;
            }
        }
        txn.commit().map_err(map_err!(transaction))?;
        Ok(())
    }

    /// Insert a record under a freshly allocated id and return it.
    ///
    /// The id is one past the larger of the table's highest key and the
    /// last id ever handed out, so ids are never reused after deletes.
    fn insert_new<T: Record>(&self, mut record: T) -> StateResult<T> {
        let txn = self.db.begin_write().map_err(map_err!(transaction))?;
        {
            let mut counters = txn.open_table(COUNTERS).map_err(map_err!(table))?;
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(table))?;
            let last_issued = counters
                .get(T::KIND)
                .map_err(map_err!(read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            let highest_key = table
                .last()
                .map_err(map_err!(read))?
                .map(|(key, _)| key.value())
                .unwrap_or(0);
            let id = last_issued.max(highest_key) + 1;
            record.set_id(id);

            let value = serde_json::to_vec(&record).map_err(map_err!(encode))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(write))?;
            counters.insert(T::KIND, id).map_err(map_err!(write))?;
        }
        txn.commit().map_err(map_err!(transaction))?;
        debug!(kind = T::KIND, id = record.id(), "record created");
        Ok(record)
    }

    fn get<T: Record>(&self, id: u64) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(table))?;
        match table.get(id).map_err(map_err!(read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(decode))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn require<T: Record>(&self, id: u64) -> StateResult<T> {
        self.get(id)?
            .ok_or(StateError::NotFound { kind: T::KIND, id })
    }

    /// Scan a table in ascending id order, keeping records matching `pred`.
    fn scan<T: Record>(&self, pred: impl Fn(&T) -> bool) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(read))? {
            let (_, value) = entry.map_err(map_err!(read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(decode))?;
            if pred(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }

    fn delete_all<T: Record>(&self, ids: &[u64]) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(transaction))?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(table))?;
            for &id in ids {
                if table.remove(id).map_err(map_err!(write))?.is_some() {
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(transaction))?;
        debug!(kind = T::KIND, removed, "records deleted");
        Ok(removed)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Insert a new host, allocating its id.
    pub fn create_host(&self, host: Host) -> StateResult<Host> {
        self.insert_new(host)
    }

    /// Insert or update a host.
    pub fn save_host(&self, host: &Host) -> StateResult<()> {
        self.put_all(std::slice::from_ref(host))
    }

    pub fn get_host(&self, id: HostId) -> StateResult<Option<Host>> {
        self.get(id)
    }

    /// Hosts matching `pred`, in ascending id order.
    pub fn fetch_hosts(&self, pred: impl Fn(&Host) -> bool) -> StateResult<Vec<Host>> {
        self.scan(pred)
    }

    pub fn list_hosts(&self) -> StateResult<Vec<Host>> {
        self.scan(|_| true)
    }

    // ── Labels / atomic groups ─────────────────────────────────────

    pub fn create_label(&self, label: Label) -> StateResult<Label> {
        self.insert_new(label)
    }

    pub fn save_label(&self, label: &Label) -> StateResult<()> {
        self.put_all(std::slice::from_ref(label))
    }

    pub fn list_labels(&self) -> StateResult<Vec<Label>> {
        self.scan(|_| true)
    }

    pub fn create_atomic_group(&self, group: AtomicGroup) -> StateResult<AtomicGroup> {
        self.insert_new(group)
    }

    pub fn list_atomic_groups(&self) -> StateResult<Vec<AtomicGroup>> {
        self.scan(|_| true)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn create_job(&self, job: Job) -> StateResult<Job> {
        self.insert_new(job)
    }

    pub fn save_job(&self, job: &Job) -> StateResult<()> {
        self.put_all(std::slice::from_ref(job))
    }

    pub fn get_job(&self, id: JobId) -> StateResult<Option<Job>> {
        self.get(id)
    }

    /// Get a job, failing with `NotFound` if it does not exist.
    pub fn require_job(&self, id: JobId) -> StateResult<Job> {
        self.require(id)
    }

    pub fn fetch_jobs(&self, pred: impl Fn(&Job) -> bool) -> StateResult<Vec<Job>> {
        self.scan(pred)
    }

    // ── Host queue entries ─────────────────────────────────────────

    pub fn create_queue_entry(&self, entry: HostQueueEntry) -> StateResult<HostQueueEntry> {
        self.insert_new(entry)
    }

    pub fn save_queue_entry(&self, entry: &HostQueueEntry) -> StateResult<()> {
        self.put_all(std::slice::from_ref(entry))
    }

    /// Upsert several entries atomically.
    pub fn save_queue_entries(&self, entries: &[HostQueueEntry]) -> StateResult<()> {
        self.put_all(entries)
    }

    pub fn get_queue_entry(&self, id: EntryId) -> StateResult<Option<HostQueueEntry>> {
        self.get(id)
    }

    /// Entries matching `pred`, in ascending id order.
    pub fn fetch_queue_entries(
        &self,
        pred: impl Fn(&HostQueueEntry) -> bool,
    ) -> StateResult<Vec<HostQueueEntry>> {
        self.scan(pred)
    }

    /// Queued entries in scheduling order: job priority descending, then
    /// entries with a concrete host before metahost entries, then job id,
    /// then entry id.
    ///
    /// Entries whose job no longer exists are skipped.
    pub fn pending_queue_entries(&self) -> StateResult<Vec<HostQueueEntry>> {
        let priorities: HashMap<JobId, i32> = self
            .scan::<Job>(|_| true)?
            .into_iter()
            .map(|job| (job.id, job.priority))
            .collect();

        let mut entries = self.scan::<HostQueueEntry>(|entry| {
            entry.status == EntryStatus::Queued && priorities.contains_key(&entry.job_id)
        })?;
        entries.sort_by_key(|entry| {
            (
                std::cmp::Reverse(priorities.get(&entry.job_id).copied().unwrap_or_default()),
                entry.is_metahost(),
                entry.job_id,
                entry.id,
            )
        });
        Ok(entries)
    }

    // ── Special tasks ──────────────────────────────────────────────

    pub fn create_special_task(&self, task: SpecialTask) -> StateResult<SpecialTask> {
        self.insert_new(task)
    }

    pub fn save_special_task(&self, task: &SpecialTask) -> StateResult<()> {
        self.put_all(std::slice::from_ref(task))
    }

    pub fn fetch_special_tasks(
        &self,
        pred: impl Fn(&SpecialTask) -> bool,
    ) -> StateResult<Vec<SpecialTask>> {
        self.scan(pred)
    }

    /// Delete special tasks by id. Returns how many existed.
    pub fn delete_special_tasks(&self, ids: &[TaskId]) -> StateResult<u32> {
        self.delete_all::<SpecialTask>(ids)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn test_host(hostname: &str) -> Host {
        Host {
            id: 0,
            hostname: hostname.to_string(),
            labels: BTreeSet::new(),
            acl_groups: BTreeSet::new(),
            locked: false,
            protection: Protection::NoProtection,
            status: HostStatus::Ready,
        }
    }

    fn test_job(name: &str, priority: i32) -> Job {
        Job {
            id: 0,
            name: name.to_string(),
            owner: "debug_user".to_string(),
            priority,
            synch_count: 1,
            dependency_labels: BTreeSet::new(),
            acl_groups: BTreeSet::new(),
            ineligible_hosts: BTreeSet::new(),
            control_file: "control".to_string(),
            created_at: 1_700_000_000,
            timeout_hours: None,
            max_runtime_hours: None,
        }
    }

    #[test]
    fn create_allocates_ascending_ids() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.create_host(test_host("host1")).unwrap();
        let b = store.create_host(test_host("host2")).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);

        let job = store.create_job(test_job("job1", 0)).unwrap();
        assert_eq!(job.id, 1, "each table has its own id sequence");
    }

    #[test]
    fn create_skips_past_explicitly_saved_ids() {
        let store = StateStore::open_in_memory().unwrap();
        let mut host = test_host("imported");
        host.id = 40;
        store.save_host(&host).unwrap();

        let next = store.create_host(test_host("new")).unwrap();
        assert_eq!(next.id, 41);
    }

    #[test]
    fn ids_not_reused_after_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let t1 = store
            .create_special_task(SpecialTask::new(1, SpecialTaskKind::Verify, 10))
            .unwrap();
        let t2 = store
            .create_special_task(SpecialTask::new(1, SpecialTaskKind::Verify, 11))
            .unwrap();
        assert_eq!(store.delete_special_tasks(&[t2.id]).unwrap(), 1);

        let t3 = store
            .create_special_task(SpecialTask::new(1, SpecialTaskKind::Cleanup, 12))
            .unwrap();
        assert!(t3.id > t2.id);
        assert!(t1.id < t2.id);
    }

    #[test]
    fn save_updates_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut host = store.create_host(test_host("host1")).unwrap();
        host.status = HostStatus::RepairFailed;
        host.locked = true;
        store.save_host(&host).unwrap();

        let got = store.get_host(host.id).unwrap().unwrap();
        assert_eq!(got.status, HostStatus::RepairFailed);
        assert!(got.locked);
        assert_eq!(store.list_hosts().unwrap().len(), 1);
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_host(7).unwrap().is_none());
        assert!(matches!(
            store.require_job(3),
            Err(StateError::NotFound { kind: "job", id: 3 })
        ));
    }

    #[test]
    fn fetch_hosts_filters_in_id_order() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..5 {
            let mut host = test_host(&format!("host{i}"));
            if i % 2 == 0 {
                host.status = HostStatus::RepairFailed;
            }
            store.create_host(host).unwrap();
        }

        let failed = store
            .fetch_hosts(|h| h.status == HostStatus::RepairFailed)
            .unwrap();
        let ids: Vec<_> = failed.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[test]
    fn pending_entries_ordered_by_priority_then_host_first() {
        let store = StateStore::open_in_memory().unwrap();
        let low = store.create_job(test_job("low", 0)).unwrap();
        let high = store.create_job(test_job("high", 10)).unwrap();

        let low_meta = store
            .create_queue_entry(HostQueueEntry::for_label(low.id, 1))
            .unwrap();
        let high_meta = store
            .create_queue_entry(HostQueueEntry::for_label(high.id, 1))
            .unwrap();
        let high_host = store
            .create_queue_entry(HostQueueEntry::for_host(high.id, 2))
            .unwrap();
        let mut done = HostQueueEntry::for_host(high.id, 3);
        done.status = EntryStatus::Completed;
        store.create_queue_entry(done).unwrap();

        let pending: Vec<_> = store
            .pending_queue_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(pending, vec![high_host.id, high_meta.id, low_meta.id]);
    }

    #[test]
    fn pending_entries_skip_missing_jobs() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_queue_entry(HostQueueEntry::for_host(99, 1))
            .unwrap();
        assert!(store.pending_queue_entries().unwrap().is_empty());
    }

    #[test]
    fn save_queue_entries_is_atomic_batch() {
        let store = StateStore::open_in_memory().unwrap();
        let mut a = store
            .create_queue_entry(HostQueueEntry::for_label(1, 1))
            .unwrap();
        let mut b = store
            .create_queue_entry(HostQueueEntry::for_label(1, 1))
            .unwrap();
        a.host_id = Some(4);
        a.status = EntryStatus::Scheduled;
        b.host_id = Some(5);
        b.status = EntryStatus::Scheduled;
        store.save_queue_entries(&[a, b]).unwrap();

        let scheduled = store
            .fetch_queue_entries(|e| e.status == EntryStatus::Scheduled)
            .unwrap();
        let hosts: Vec<_> = scheduled.iter().filter_map(|e| e.host_id).collect();
        assert_eq!(hosts, vec![4, 5]);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.create_host(test_host("persisted")).unwrap();
            store.create_job(test_job("persisted", 1)).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let hosts = store.list_hosts().unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].hostname, "persisted");
        let next = store.create_host(test_host("after")).unwrap();
        assert_eq!(next.id, 2);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_hosts().unwrap().is_empty());
        assert!(store.list_labels().unwrap().is_empty());
        assert!(store.list_atomic_groups().unwrap().is_empty());
        assert!(store.fetch_special_tasks(|_| true).unwrap().is_empty());
        assert_eq!(store.delete_special_tasks(&[1, 2]).unwrap(), 0);
    }
}
