//! Migration listeners.
//!
//! Listeners are stored under opaque ids in a copy-on-write list. Firing
//! iterates a snapshot of the list, so a listener added or removed while an
//! event is being delivered affects only later events.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use corelib::{Address, MigrationId, MigrationInfo, MigrationStatus, PartitionId};
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::error::{MigrationError, Result};

/// What a listener is told about a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationEvent {
    pub migration_id: MigrationId,
    pub partition_id: PartitionId,
    pub old_address: Option<Address>,
    pub new_address: Address,
    pub replica_index: usize,
    pub status: MigrationStatus,
}

impl From<&MigrationInfo> for MigrationEvent {
    fn from(info: &MigrationInfo) -> Self {
        Self {
            migration_id: info.id,
            partition_id: info.partition_id,
            old_address: info.source.clone(),
            new_address: info.destination.clone(),
            replica_index: info.replica_index,
            status: info.status,
        }
    }
}

/// Callbacks for migration lifecycle events.
///
/// `migration_started` fires once when a migration becomes active, followed
/// by exactly one of the other two.
pub trait MigrationListener: Send + Sync + 'static {
    fn migration_started(&self, event: &MigrationEvent);

    fn migration_completed(&self, event: &MigrationEvent);

    fn migration_failed(&self, event: &MigrationEvent);
}

/// Registration handle returned by [`ListenerRegistry::add`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum EventKind {
    Started,
    Completed,
    Failed,
}

type Entries = Arc<Vec<(ListenerId, Arc<dyn MigrationListener>)>>;

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    entries: RwLock<Entries>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. The same listener may be registered more than
    /// once; each registration gets its own id and fires on its own.
    pub fn add(&self, listener: Option<Arc<dyn MigrationListener>>) -> Result<ListenerId> {
        let listener =
            listener.ok_or(MigrationError::Core(corelib::Error::NullArgument("listener")))?;
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut entries = self.entries.write();
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push((id, listener));
        *entries = Arc::new(next);
        debug!(%id, "migration listener added");
        Ok(id)
    }

    /// Unregisters a listener. Unknown ids return false.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        if !entries.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: Vec<_> = entries
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *entries = Arc::new(next);
        debug!(%id, "migration listener removed");
        true
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn fire(&self, kind: EventKind, event: &MigrationEvent) {
        let snapshot = Arc::clone(&self.entries.read());
        for (id, listener) in snapshot.iter() {
            let delivered = catch_unwind(AssertUnwindSafe(|| match kind {
                EventKind::Started => listener.migration_started(event),
                EventKind::Completed => listener.migration_completed(event),
                EventKind::Failed => listener.migration_failed(event),
            }));
            if delivered.is_err() {
                error!(%id, ?kind, partition_id = %event.partition_id, "migration listener panicked");
            }
        }
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
