// src/db/streams.rs

//! Dependency-tracked reactive streams
//!
//! A stream owns a query, a dependency set of table names, and a subscriber
//! callback. After every committed transaction the registry re-runs the
//! streams whose dependency set intersects the affected tables and hands
//! each subscriber the fresh result set.
//!
//! Notifications are queued and drained by a single caller at a time, so a
//! subscriber sees emissions in commit order and a subscriber that mutates
//! the database from inside its callback enqueues rather than recurses.
//! A subscriber that returns an error is terminated: the error is reported
//! once and the stream slot freed.

use crate::db::query::{Query, Row};
use crate::db::Database;
use crate::error::Result;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error};

/// Identifies a registered stream; pass to [`Database::unwatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle(u64);

type Subscriber = Box<dyn FnMut(&[Row]) -> anyhow::Result<()> + Send>;

struct StreamEntry {
    id: u64,
    query: Query,
    deps: HashSet<String>,
    subscriber: Subscriber,
}

struct PendingQueue {
    queue: VecDeque<HashSet<String>>,
    draining: bool,
}

pub(crate) struct StreamRegistry {
    entries: Mutex<Vec<StreamEntry>>,
    /// Streams unsubscribed while temporarily checked out by `notify`
    cancelled: Mutex<HashSet<u64>>,
    pending: Mutex<PendingQueue>,
    next_id: AtomicU64,
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            cancelled: Mutex::new(HashSet::new()),
            pending: Mutex::new(PendingQueue {
                queue: VecDeque::new(),
                draining: false,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, query: Query, deps: HashSet<String>, subscriber: Subscriber) -> StreamHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock_or_recover(&self.entries).push(StreamEntry {
            id,
            query,
            deps,
            subscriber,
        });
        StreamHandle(id)
    }

    fn unregister(&self, handle: StreamHandle) {
        let mut entries = lock_or_recover(&self.entries);
        if let Some(pos) = entries.iter().position(|e| e.id == handle.0) {
            entries.remove(pos);
        } else {
            // Checked out by a notify in progress; flag it so the in-flight
            // re-execution is dropped instead of re-registered
            lock_or_recover(&self.cancelled).insert(handle.0);
        }
    }

    /// Announce committed changes; re-runs every stream whose dependency
    /// set intersects `affected`
    pub(crate) fn notify(&self, db: &Database, affected: &HashSet<String>) {
        {
            let mut pending = lock_or_recover(&self.pending);
            pending.queue.push_back(affected.clone());
            if pending.draining {
                return;
            }
            pending.draining = true;
        }

        loop {
            let batch = {
                let mut pending = lock_or_recover(&self.pending);
                match pending.queue.pop_front() {
                    Some(batch) => batch,
                    None => {
                        pending.draining = false;
                        return;
                    }
                }
            };
            self.run_affected(db, &batch);
        }
    }

    fn run_affected(&self, db: &Database, affected: &HashSet<String>) {
        let ids: Vec<u64> = {
            let entries = lock_or_recover(&self.entries);
            entries
                .iter()
                .filter(|e| !e.deps.is_disjoint(affected))
                .map(|e| e.id)
                .collect()
        };

        for id in ids {
            // Check the entry out so the subscriber may call back into the
            // database (including unwatch) without deadlocking
            let entry = {
                let mut entries = lock_or_recover(&self.entries);
                entries
                    .iter()
                    .position(|e| e.id == id)
                    .map(|pos| entries.remove(pos))
            };
            let Some(mut entry) = entry else { continue };

            let keep = match db.query(&entry.query) {
                Ok(rows) => match (entry.subscriber)(&rows) {
                    Ok(()) => true,
                    Err(e) => {
                        error!("stream subscriber failed, terminating subscription: {}", e);
                        false
                    }
                },
                Err(e) => {
                    error!("stream re-execution failed, terminating subscription: {}", e);
                    false
                }
            };

            let was_cancelled = lock_or_recover(&self.cancelled).remove(&id);
            if keep && !was_cancelled {
                lock_or_recover(&self.entries).push(entry);
            }
        }
    }
}

impl Database {
    /// Open a reactive stream over a query
    ///
    /// The dependency set is inferred from the query target (a view
    /// contributes its base tables). The subscriber receives the current
    /// result set immediately, then a fresh one after every committed
    /// change touching a dependency.
    pub fn watch<F>(&self, query: Query, subscriber: F) -> Result<StreamHandle>
    where
        F: FnMut(&[Row]) -> anyhow::Result<()> + Send + 'static,
    {
        let deps: HashSet<String> = self
            .schema()
            .dependency_tables(query.target())
            .into_iter()
            .collect();
        self.watch_tables(query, deps, subscriber)
    }

    /// Open a reactive stream with an explicit dependency set
    pub fn watch_tables<F>(
        &self,
        query: Query,
        deps: impl IntoIterator<Item = impl Into<String>>,
        mut subscriber: F,
    ) -> Result<StreamHandle>
    where
        F: FnMut(&[Row]) -> anyhow::Result<()> + Send + 'static,
    {
        let deps: HashSet<String> = deps.into_iter().map(Into::into).collect();

        let rows = self.query(&query)?;
        if let Err(e) = subscriber(&rows) {
            error!("stream subscriber failed on initial emission: {}", e);
            // Hand back an already-freed slot; nothing was registered
            return Ok(StreamHandle(0));
        }

        debug!("stream registered over {:?}", deps);
        Ok(self
            .streams()
            .register(query, deps, Box::new(subscriber)))
    }

    /// Cancel a stream; frees the slot and drops any in-flight re-execution
    pub fn unwatch(&self, handle: StreamHandle) {
        self.streams().unregister(handle);
    }
}
