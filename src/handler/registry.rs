//! In-flight request table.
//!
//! Maps request ids to the cancellation token and task of the handler
//! serving them. Every entry carries a generation number so a handler that
//! finishes after its id was reused can never remove the newer entry.
//!
//! # Example
//!
//! ```ignore
//! use ble_http_bridge::handler::RequestRegistry;
//! use tokio_util::sync::CancellationToken;
//!
//! let registry = RequestRegistry::new();
//! let token = CancellationToken::new();
//!
//! let generation = registry.insert(7, token.clone());
//! registry.attach(7, generation, tokio::spawn(async {}));
//!
//! assert!(registry.cancel(7));
//! assert!(token.is_cancelled());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One running handler.
#[derive(Debug)]
struct InFlight {
    generation: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Table {
    /// Current handler per id.
    active: HashMap<u32, InFlight>,
    /// Handlers whose id was reused while they were still running.
    shadowed: Vec<(u32, InFlight)>,
}

/// Table of in-flight requests for one connection.
///
/// All mutations take a short lock; nothing is held across an await.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    table: Mutex<Table>,
    next_generation: AtomicU64,
}

impl RequestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, cancel: CancellationToken) -> InFlight {
        InFlight {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            cancel,
            task: None,
        }
    }

    /// Register a request, shadowing any running handler with the same id.
    ///
    /// The shadowed handler keeps running uncancelled; it is no longer
    /// reachable by [`cancel`](Self::cancel). Returns the new entry's
    /// generation.
    pub fn insert(&self, id: u32, cancel: CancellationToken) -> u64 {
        let entry = self.entry(cancel);
        let generation = entry.generation;

        let mut table = self.lock();
        if let Some(previous) = table.active.insert(id, entry) {
            table.shadowed.push((id, previous));
        }
        generation
    }

    /// Register a request unless the id is already in flight.
    ///
    /// Returns `None` (and registers nothing) for a duplicate id.
    pub fn try_insert(&self, id: u32, cancel: CancellationToken) -> Option<u64> {
        let mut table = self.lock();
        if table.active.contains_key(&id) {
            return None;
        }
        let entry = self.entry(cancel);
        let generation = entry.generation;
        table.active.insert(id, entry);
        Some(generation)
    }

    /// Attach the spawned task to its entry.
    ///
    /// If the entry is already gone (the task finished or was cancelled
    /// first), the handle is dropped and the task runs detached.
    pub fn attach(&self, id: u32, generation: u64, task: JoinHandle<()>) {
        let mut table = self.lock();
        let Table { active, shadowed } = &mut *table;

        let slot = match active.get_mut(&id) {
            Some(entry) if entry.generation == generation => Some(entry),
            _ => shadowed
                .iter_mut()
                .find(|(_, e)| e.generation == generation)
                .map(|(_, e)| e),
        };

        if let Some(entry) = slot {
            entry.task = Some(task);
        }
    }

    /// Remove the entry of a finished handler.
    ///
    /// Returns `false` if that generation was no longer registered.
    pub fn complete(&self, id: u32, generation: u64) -> bool {
        let mut table = self.lock();

        if table
            .active
            .get(&id)
            .is_some_and(|e| e.generation == generation)
        {
            table.active.remove(&id);
            return true;
        }

        let before = table.shadowed.len();
        table.shadowed.retain(|(_, e)| e.generation != generation);
        table.shadowed.len() != before
    }

    /// Cancel the current handler for `id` and remove its entry.
    ///
    /// Does not wait for the handler to stop. Returns `false` if no request
    /// with that id is in flight.
    pub fn cancel(&self, id: u32) -> bool {
        let removed = self.lock().active.remove(&id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every handler, shadowed ones included, and empty the table.
    ///
    /// Returns the task handles so the caller can wait for them to stop.
    pub fn cancel_all(&self) -> Vec<JoinHandle<()>> {
        let mut guard = self.lock();
        let table = &mut *guard;
        let active = table.active.drain().map(|(_, e)| e);
        let shadowed = std::mem::take(&mut table.shadowed).into_iter().map(|(_, e)| e);

        active
            .chain(shadowed)
            .filter_map(|entry| {
                entry.cancel.cancel();
                entry.task
            })
            .collect()
    }

    /// Whether a request with this id is in flight.
    pub fn contains(&self, id: u32) -> bool {
        self.lock().active.contains_key(&id)
    }

    /// Number of running handlers, shadowed ones included.
    pub fn len(&self) -> usize {
        let table = self.lock();
        table.active.len() + table.shadowed.len()
    }

    /// Whether no handler is running.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
