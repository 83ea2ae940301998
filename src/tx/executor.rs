//! Local execution of replicated transactions
//!
//! Each member executes its copy of a [`TransactionTask`] against its own
//! storage through two narrow seams: the [`LockManager`], which owns record
//! and key locks and signals contention, and the [`RecordStore`], which
//! applies record operations under optimistic versioning.
//!
//! Lock contention is flow control, not failure: the contended task gets its
//! retry count bumped and goes back on the [`RetryQueue`] for a later
//! delivery, and no terminal outcome is produced. Every other condition maps
//! deterministically onto a [`TxOutcome`].

use crate::common::{CoordinatorConfig, Error, NodeId, Result};
use crate::tx::outcome::TxOutcome;
use crate::tx::task::{OperationKind, RecordId, TransactionTask};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Result of a lock acquisition attempt. The deadline policy lives in the
/// lock manager; the coordination layer only interprets the signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Acquired,
    /// Contention: another in-flight transaction holds the lock. Carries the
    /// node believed to hold it, for diagnostics.
    Timeout { node: NodeId },
}

/// Record and index-key locking, arbitrated outside this crate.
pub trait LockManager: Send + Sync {
    fn lock_record(&self, record: &RecordId) -> LockStatus;
    fn lock_key(&self, key: &str) -> LockStatus;
    fn release_record(&self, record: &RecordId);
    fn release_key(&self, key: &str);
}

/// Typed conflicts a store may raise while applying a record operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    ConcurrentModification {
        record: RecordId,
        server_version: i32,
    },
    UniqueIndexViolation {
        record: RecordId,
        index: String,
        key: String,
    },
    ConcurrentCreation {
        actual: RecordId,
        expected: RecordId,
    },
    /// Any other runtime failure during apply.
    Failure(String),
}

impl ApplyError {
    fn into_outcome(self) -> TxOutcome {
        match self {
            ApplyError::ConcurrentModification {
                record,
                server_version,
            } => TxOutcome::ConcurrentModification {
                record,
                server_version,
            },
            ApplyError::UniqueIndexViolation { record, index, key } => {
                TxOutcome::UniqueIndexViolation { record, index, key }
            }
            ApplyError::ConcurrentCreation { actual, expected } => {
                TxOutcome::ConcurrentCreation { actual, expected }
            }
            ApplyError::Failure(message) => TxOutcome::Failure { message },
        }
    }
}

/// Storage seam: applies staged record operations, then commits or rolls the
/// staging back as phase 2 directs.
pub trait RecordStore: Send {
    /// Apply one operation under optimistic versioning; returns the new
    /// record version.
    fn apply(&mut self, op: &crate::tx::task::RecordOp) -> std::result::Result<i32, ApplyError>;

    /// Make all staged operations durable.
    fn commit(&mut self) -> std::result::Result<(), ApplyError>;

    /// Discard all staged operations.
    fn rollback(&mut self);
}

/// Queue of lock-contended tasks awaiting redelivery.
///
/// Each entry becomes ready after the backoff for its retry count has
/// elapsed. The owning request handler polls [`RetryQueue::pop_ready`] on
/// its delivery interval and re-executes whatever has come due.
#[derive(Default)]
pub struct RetryQueue {
    queue: VecDeque<(Instant, TransactionTask)>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task for redelivery after `delay`.
    pub fn push_after(&mut self, task: TransactionTask, delay: Duration) {
        self.queue.push_back((Instant::now() + delay, task));
    }

    /// Take the first task whose backoff has elapsed at `now`, if any.
    pub fn pop_ready(&mut self, now: Instant) -> Option<TransactionTask> {
        let idx = self.queue.iter().position(|(ready_at, _)| *ready_at <= now)?;
        self.queue.remove(idx).map(|(_, task)| task)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Outcome of one phase-1 execution attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Phase1 {
    /// Terminal outcome, to be reported back to the coordinator.
    Done(TxOutcome),
    /// Lock contention; the task went back on the retry queue.
    Requeued,
}

/// Execute phase 1 of a task locally.
///
/// `unique_keys` are this replica's unique-index keys touched by the task,
/// resolved from its own index metadata (keys are not shipped on the wire).
/// On contention the task goes back on `retries` with the jittered backoff
/// for its new retry count. On success, record and key locks stay held until
/// [`execute_phase2`].
pub fn execute_phase1(
    mut task: TransactionTask,
    unique_keys: &[String],
    config: &CoordinatorConfig,
    store: &mut dyn RecordStore,
    locks: &dyn LockManager,
    retries: &mut RetryQueue,
) -> Phase1 {
    let mut held_records: Vec<RecordId> = Vec::new();
    let mut held_keys: Vec<String> = Vec::new();

    for op in task.operations() {
        if op.kind == OperationKind::Loaded {
            continue;
        }
        match locks.lock_record(&op.id) {
            LockStatus::Acquired => held_records.push(op.id),
            LockStatus::Timeout { node } => {
                let record = op.id;
                release_all(locks, &held_records, &held_keys);
                task.bump_retry();
                let delay = config.retry_backoff(task.retry_count());
                tracing::debug!(
                    record = %record,
                    holder = %node,
                    retry = task.retry_count(),
                    delay_ms = delay.as_millis() as u64,
                    "record lock contended, re-enqueueing task"
                );
                retries.push_after(task, delay);
                return Phase1::Requeued;
            }
        }
    }

    for key in unique_keys {
        match locks.lock_key(key) {
            LockStatus::Acquired => held_keys.push(key.clone()),
            LockStatus::Timeout { node } => {
                release_all(locks, &held_records, &held_keys);
                task.bump_retry();
                let delay = config.retry_backoff(task.retry_count());
                tracing::debug!(
                    key = %key,
                    holder = %node,
                    retry = task.retry_count(),
                    delay_ms = delay.as_millis() as u64,
                    "key lock contended, re-enqueueing task"
                );
                retries.push_after(task, delay);
                return Phase1::Requeued;
            }
        }
    }

    for op in task.operations() {
        if op.kind == OperationKind::Loaded {
            continue;
        }
        if let Err(e) = store.apply(op) {
            store.rollback();
            release_all(locks, &held_records, &held_keys);
            return Phase1::Done(e.into_outcome());
        }
    }

    Phase1::Done(TxOutcome::Success)
}

/// Execute phase 2: commit or roll back the staged transaction and release
/// all locks taken in phase 1.
pub fn execute_phase2(
    node: &NodeId,
    task: &TransactionTask,
    unique_keys: &[String],
    commit: bool,
    store: &mut dyn RecordStore,
    locks: &dyn LockManager,
) -> Result<()> {
    let result = if commit {
        store.commit().map_err(|e| Error::CommitFailed {
            node: node.to_string(),
            reason: e.into_outcome().to_string(),
        })
    } else {
        store.rollback();
        Ok(())
    };

    for op in task.operations() {
        if op.kind != OperationKind::Loaded {
            locks.release_record(&op.id);
        }
    }
    for key in unique_keys {
        locks.release_key(key);
    }

    result
}

fn release_all(locks: &dyn LockManager, records: &[RecordId], keys: &[String]) {
    for record in records {
        locks.release_record(record);
    }
    for key in keys {
        locks.release_key(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::task::{IndexTouch, RecordOp};
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct MapStore {
        versions: std::collections::HashMap<RecordId, i32>,
        committed: bool,
        fail_with: Option<ApplyError>,
    }

    impl MapStore {
        fn new() -> Self {
            Self {
                versions: Default::default(),
                committed: false,
                fail_with: None,
            }
        }
    }

    impl RecordStore for MapStore {
        fn apply(&mut self, op: &RecordOp) -> std::result::Result<i32, ApplyError> {
            if let Some(e) = self.fail_with.clone() {
                return Err(e);
            }
            let v = self.versions.entry(op.id).or_insert(0);
            *v += 1;
            Ok(*v)
        }

        fn commit(&mut self) -> std::result::Result<(), ApplyError> {
            self.committed = true;
            Ok(())
        }

        fn rollback(&mut self) {
            self.versions.clear();
        }
    }

    /// Lock manager that times out on a configured set of records until
    /// `free` is called.
    struct ContendedLocks {
        contended: Mutex<HashSet<RecordId>>,
    }

    impl ContendedLocks {
        fn new(contended: &[RecordId]) -> Self {
            Self {
                contended: Mutex::new(contended.iter().copied().collect()),
            }
        }

        fn free(&self, record: &RecordId) {
            self.contended.lock().unwrap().remove(record);
        }
    }

    impl LockManager for ContendedLocks {
        fn lock_record(&self, record: &RecordId) -> LockStatus {
            if self.contended.lock().unwrap().contains(record) {
                LockStatus::Timeout {
                    node: NodeId::from("peer-2"),
                }
            } else {
                LockStatus::Acquired
            }
        }

        fn lock_key(&self, _key: &str) -> LockStatus {
            LockStatus::Acquired
        }

        fn release_record(&self, _record: &RecordId) {}
        fn release_key(&self, _key: &str) {}
    }

    fn one_update() -> TransactionTask {
        TransactionTask::build(
            &[RecordOp {
                id: RecordId::new(1, 1),
                version: 1,
                kind: OperationKind::Update,
                payload: vec![1, 2, 3],
                record_type: b'd',
            }],
            &[],
        )
    }

    #[test]
    fn test_lock_retry_loop() {
        let rid = RecordId::new(1, 1);
        let locks = ContendedLocks::new(&[rid]);
        let mut store = MapStore::new();
        let mut retries = RetryQueue::new();
        let config = CoordinatorConfig::default();

        // First execution hits contention: no outcome, retry count bumped
        let result = execute_phase1(one_update(), &[], &config, &mut store, &locks, &mut retries);
        assert_eq!(result, Phase1::Requeued);
        assert_eq!(retries.len(), 1);

        // Not due before the backoff has elapsed
        assert!(retries.pop_ready(Instant::now()).is_none());
        assert_eq!(retries.len(), 1);

        // retry_backoff(1) is bounded by retry_delay_ms * 1.5, well inside 1s
        let retried = retries
            .pop_ready(Instant::now() + Duration::from_secs(1))
            .unwrap();
        assert_eq!(retried.retry_count(), 1);

        // Lock freed: the redelivered task succeeds
        locks.free(&rid);
        let result = execute_phase1(retried, &[], &config, &mut store, &locks, &mut retries);
        assert_eq!(result, Phase1::Done(TxOutcome::Success));
        assert!(retries.is_empty());
    }

    #[test]
    fn test_conflict_maps_to_outcome() {
        let locks = ContendedLocks::new(&[]);
        let mut store = MapStore::new();
        store.fail_with = Some(ApplyError::ConcurrentModification {
            record: RecordId::new(1, 1),
            server_version: 9,
        });
        let mut retries = RetryQueue::new();
        let config = CoordinatorConfig::default();

        let result = execute_phase1(one_update(), &[], &config, &mut store, &locks, &mut retries);
        assert_eq!(
            result,
            Phase1::Done(TxOutcome::ConcurrentModification {
                record: RecordId::new(1, 1),
                server_version: 9,
            })
        );
        assert!(retries.is_empty());
        // rollback discarded staged state
        assert!(store.versions.is_empty());
    }

    #[test]
    fn test_unique_index_violation_surfaces() {
        let locks = ContendedLocks::new(&[]);
        let mut store = MapStore::new();
        store.fail_with = Some(ApplyError::UniqueIndexViolation {
            record: RecordId::new(1, 1),
            index: "person.email".into(),
            key: "a@example.com".into(),
        });
        let mut retries = RetryQueue::new();

        let task = TransactionTask::build(
            one_update().operations(),
            &[IndexTouch {
                name: "person.email".into(),
                unique: true,
                keys: vec!["a@example.com".into()],
            }],
        );
        let config = CoordinatorConfig::default();
        let result = execute_phase1(
            task,
            &["a@example.com".into()],
            &config,
            &mut store,
            &locks,
            &mut retries,
        );
        match result {
            Phase1::Done(TxOutcome::UniqueIndexViolation { index, .. }) => {
                assert_eq!(index, "person.email");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_phase2_commit() {
        let locks = ContendedLocks::new(&[]);
        let mut store = MapStore::new();
        let mut retries = RetryQueue::new();
        let config = CoordinatorConfig::default();
        let task = one_update();

        let result = execute_phase1(task.clone(), &[], &config, &mut store, &locks, &mut retries);
        assert_eq!(result, Phase1::Done(TxOutcome::Success));

        let node = NodeId::from("node-1");
        execute_phase2(&node, &task, &[], true, &mut store, &locks).unwrap();
        assert!(store.committed);
    }

    #[test]
    fn test_phase2_rollback() {
        let locks = ContendedLocks::new(&[]);
        let mut store = MapStore::new();
        let mut retries = RetryQueue::new();
        let config = CoordinatorConfig::default();
        let task = one_update();

        execute_phase1(task.clone(), &[], &config, &mut store, &locks, &mut retries);
        let node = NodeId::from("node-1");
        execute_phase2(&node, &task, &[], false, &mut store, &locks).unwrap();
        assert!(!store.committed);
        assert!(store.versions.is_empty());
    }
}
