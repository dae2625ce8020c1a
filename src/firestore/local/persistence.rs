use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_channel::{Receiver, Sender};
use async_lock::Mutex;
use log::{debug, warn};

use crate::firestore::core::listen_sequence::ListenSequence;
use crate::firestore::core::types::{ListenSequenceNumber, TargetId};
use crate::firestore::error::{failed_precondition, internal_error, FirestoreResult};
use crate::firestore::local::bundle_cache::{BundleMetadata, NamedQuery};
use crate::firestore::local::index_manager::IndexEntry;
use crate::firestore::local::lease::{ClientMetadata, LeaseTable};
use crate::firestore::local::mutation_queue::MutationQueueMetadata;
use crate::firestore::local::remote_document_cache::RemoteDocumentEntry;
use crate::firestore::local::target_cache::TargetGlobals;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    BatchId, DocumentKey, FieldIndex, IndexState, MutationBatch, Overlay, ResourcePath, Timestamp,
};

const LOG_TAG: &str = "Persistence";

const PRIMARY_LEASE_LOST_ERROR_MSG: &str =
    "The current client is not in the required state to perform this operation. \
     It might be necessary to restart the client.";

/// Kind of access a transaction needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistenceTransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write access that also requires holding the primary lease.
    ReadWritePrimary,
}

impl PersistenceTransactionMode {
    fn is_write(&self) -> bool {
        !matches!(self, PersistenceTransactionMode::ReadOnly)
    }
}

/// Every logical store of the local cache. Keys are composite so that
/// per-user data lives side by side.
#[derive(Clone, Debug, Default)]
pub struct PersistenceStores {
    /// (user id, batch id) -> batch.
    pub(crate) mutations: BTreeMap<(String, BatchId), MutationBatch>,
    /// Index from documents to the batches touching them.
    pub(crate) document_mutations: BTreeSet<(String, DocumentKey, BatchId)>,
    /// Per user queue metadata.
    pub(crate) mutation_queues: BTreeMap<String, MutationQueueMetadata>,
    pub(crate) remote_documents: BTreeMap<DocumentKey, RemoteDocumentEntry>,
    pub(crate) targets: BTreeMap<TargetId, TargetData>,
    pub(crate) target_documents: BTreeSet<(TargetId, DocumentKey)>,
    pub(crate) document_targets: BTreeSet<(DocumentKey, TargetId)>,
    /// (user id, key) -> overlay.
    pub(crate) overlays: BTreeMap<(String, DocumentKey), Overlay>,
    pub(crate) overlays_by_batch: BTreeSet<(String, BatchId, DocumentKey)>,
    pub(crate) index_configuration: BTreeMap<i32, FieldIndex>,
    /// (index id, user id) -> backfill state.
    pub(crate) index_state: BTreeMap<(i32, String), IndexState>,
    pub(crate) index_entries: BTreeSet<IndexEntry>,
    pub(crate) collection_parents: BTreeMap<String, BTreeSet<ResourcePath>>,
    pub(crate) bundles: BTreeMap<String, BundleMetadata>,
    pub(crate) named_queries: BTreeMap<String, NamedQuery>,
    pub(crate) target_globals: TargetGlobals,
    /// Sequence numbers of documents no target references anymore.
    pub(crate) orphaned_documents: BTreeMap<DocumentKey, ListenSequenceNumber>,
    pub(crate) lease: LeaseTable,
}

type CommitCallback = Box<dyn FnOnce() + Send>;

/// Scoped access to the stores. Changes are made on a working copy that is
/// only published when the transaction function succeeds. Read-only
/// transactions borrow the committed stores instead.
pub struct PersistenceTransaction<'s> {
    label: String,
    mode: PersistenceTransactionMode,
    sequence_number: ListenSequenceNumber,
    stores: Cow<'s, PersistenceStores>,
    on_committed: Vec<CommitCallback>,
    changed_documents: BTreeSet<DocumentKey>,
}

impl Debug for PersistenceTransaction<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceTransaction")
            .field("label", &self.label)
            .field("mode", &self.mode)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

impl PersistenceTransaction<'_> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mode(&self) -> PersistenceTransactionMode {
        self.mode
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    /// Registers `callback` to run once after the transaction commits.
    /// Dropped without running on rollback.
    pub fn add_on_committed<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_committed.push(Box::new(callback));
    }

    pub(crate) fn stores(&self) -> &PersistenceStores {
        &self.stores
    }

    pub(crate) fn stores_mut(&mut self) -> FirestoreResult<&mut PersistenceStores> {
        if !self.mode.is_write() {
            return Err(internal_error(format!(
                "Cannot write in read-only transaction '{}'",
                self.label
            )));
        }
        Ok(self.stores.to_mut())
    }

    pub(crate) fn record_changed_document(&mut self, key: &DocumentKey) {
        self.changed_documents.insert(key.clone());
    }
}

/// Notification published after another client committed a write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistenceChange {
    pub source_client_id: String,
    pub label: String,
    pub sequence_number: ListenSequenceNumber,
    pub changed_documents: BTreeSet<DocumentKey>,
}

type PrimaryStateListener = Arc<dyn Fn(bool) + Send + Sync>;

struct SharedStorage {
    stores: Mutex<PersistenceStores>,
    listen_sequence: ListenSequence,
    subscribers: StdMutex<Vec<(String, Sender<PersistenceChange>)>>,
}

/// In-memory persistence. Several clients of the same process may share one
/// storage through [`MemoryPersistence::share`]; the primary lease decides
/// which of them talks to the backend.
pub struct MemoryPersistence {
    storage: Arc<SharedStorage>,
    client_id: String,
    started: AtomicBool,
    shut_down: AtomicBool,
    is_primary: AtomicBool,
    network_enabled: AtomicBool,
    primary_state_listener: StdMutex<Option<PrimaryStateListener>>,
}

impl Debug for MemoryPersistence {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPersistence")
            .field("client_id", &self.client_id)
            .field("is_primary", &self.is_primary())
            .finish()
    }
}

impl MemoryPersistence {
    pub fn new(client_id: impl Into<String>) -> Self {
        let storage = Arc::new(SharedStorage {
            stores: Mutex::new(PersistenceStores::default()),
            listen_sequence: ListenSequence::new(0),
            subscribers: StdMutex::new(Vec::new()),
        });
        Self::with_storage(storage, client_id.into())
    }

    /// Another client over the same storage, with its own lease state.
    pub fn share(&self, client_id: impl Into<String>) -> Self {
        Self::with_storage(Arc::clone(&self.storage), client_id.into())
    }

    fn with_storage(storage: Arc<SharedStorage>, client_id: String) -> Self {
        Self {
            storage,
            client_id,
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            is_primary: AtomicBool::new(false),
            network_enabled: AtomicBool::new(true),
            primary_state_listener: StdMutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shut_down.load(Ordering::SeqCst)
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    /// Registers the client and attempts to take the primary lease.
    pub async fn start(&self) -> FirestoreResult<bool> {
        self.start_at(Timestamp::now().to_millis()).await
    }

    pub async fn start_at(&self, now_ms: i64) -> FirestoreResult<bool> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(failed_precondition("Persistence has already been shut down."));
        }
        self.started.store(true, Ordering::SeqCst);
        self.refresh_lease_at(now_ms).await
    }

    /// Installs the callback told about primary state changes. It is invoked
    /// right away with the current state.
    pub fn set_primary_state_listener<F>(&self, listener: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let listener: PrimaryStateListener = Arc::new(listener);
        {
            let mut guard = self
                .primary_state_listener
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            *guard = Some(Arc::clone(&listener));
        }
        listener(self.is_primary());
    }

    pub fn set_network_enabled(&self, enabled: bool) {
        self.network_enabled.store(enabled, Ordering::SeqCst);
    }

    pub async fn refresh_lease(&self) -> FirestoreResult<bool> {
        self.refresh_lease_at(Timestamp::now().to_millis()).await
    }

    /// Refreshes this client's metadata row and extends or acquires the
    /// primary lease. Returns whether the client is primary afterwards.
    pub async fn refresh_lease_at(&self, now_ms: i64) -> FirestoreResult<bool> {
        if !self.is_started() {
            return Err(failed_precondition("Persistence is not started."));
        }
        let primary = {
            let mut stores = self.storage.stores.lock().await;
            stores.lease.update_client_metadata(ClientMetadata {
                client_id: self.client_id.clone(),
                update_time_ms: now_ms,
                network_enabled: self.network_enabled.load(Ordering::SeqCst),
                in_foreground: true,
            });
            for pruned in stores.lease.prune_inactive_clients(now_ms) {
                debug!("[{LOG_TAG}] Pruned metadata of inactive client {pruned}");
            }
            stores.lease.try_acquire_or_extend(&self.client_id, now_ms)
        };
        self.set_primary(primary);
        Ok(primary)
    }

    fn set_primary(&self, primary: bool) {
        let previous = self.is_primary.swap(primary, Ordering::SeqCst);
        if previous == primary {
            return;
        }
        debug!(
            "[{LOG_TAG}] Client {} is now {}",
            self.client_id,
            if primary { "primary" } else { "secondary" }
        );
        let listener = self
            .primary_state_listener
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener(primary);
        }
    }

    /// Releases the lease and rejects every later transaction.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut stores = self.storage.stores.lock().await;
            stores.lease.release_lease(&self.client_id);
            stores.lease.remove_client(&self.client_id);
        }
        self.is_primary.store(false, Ordering::SeqCst);
        self.storage
            .subscribers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .retain(|(client_id, _)| client_id != &self.client_id);
    }

    /// Changes committed by other clients sharing this storage.
    pub fn subscribe_changes(&self) -> Receiver<PersistenceChange> {
        let (sender, receiver) = async_channel::unbounded();
        self.storage
            .subscribers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push((self.client_id.clone(), sender));
        receiver
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.storage.listen_sequence.current()
    }

    /// Runs `operation` against a working copy of the stores, or against the
    /// committed stores for [`PersistenceTransactionMode::ReadOnly`]. `Ok` commits
    /// the copy and fires the committed callbacks in registration order;
    /// `Err` discards it.
    pub async fn run_transaction<T, F>(
        &self,
        label: &str,
        mode: PersistenceTransactionMode,
        operation: F,
    ) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction) -> FirestoreResult<T>,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(failed_precondition(format!(
                "Cannot run transaction '{label}' after persistence was shut down."
            )));
        }

        let mut stores = self.storage.stores.lock().await;

        if mode == PersistenceTransactionMode::ReadWritePrimary
            && !stores.lease.is_owner(&self.client_id)
        {
            drop(stores);
            self.set_primary(false);
            return Err(failed_precondition(PRIMARY_LEASE_LOST_ERROR_MSG));
        }

        let sequence_number = if mode.is_write() {
            self.storage.listen_sequence.next()
        } else {
            self.storage.listen_sequence.current()
        };

        let mut transaction = PersistenceTransaction {
            label: label.to_string(),
            mode,
            sequence_number,
            stores: if mode.is_write() {
                Cow::Owned(stores.clone())
            } else {
                Cow::Borrowed(&*stores)
            },
            on_committed: Vec::new(),
            changed_documents: BTreeSet::new(),
        };

        let result = operation(&mut transaction);
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                debug!("[{LOG_TAG}] Transaction '{label}' rolled back: {err}");
                return Err(err);
            }
        };

        let PersistenceTransaction {
            stores: working_copy,
            on_committed,
            changed_documents,
            ..
        } = transaction;
        if let Cow::Owned(working_copy) = working_copy {
            *stores = working_copy;
        }
        drop(stores);

        if mode.is_write() && !changed_documents.is_empty() {
            self.publish_change(PersistenceChange {
                source_client_id: self.client_id.clone(),
                label: label.to_string(),
                sequence_number,
                changed_documents,
            });
        }

        for callback in on_committed {
            callback();
        }
        Ok(value)
    }

    fn publish_change(&self, change: PersistenceChange) {
        let mut subscribers = self
            .storage
            .subscribers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        subscribers.retain(|(client_id, sender)| {
            if client_id == &change.source_client_id {
                return !sender.is_closed();
            }
            match sender.try_send(change.clone()) {
                Ok(()) => true,
                Err(err) => {
                    warn!("[{LOG_TAG}] Dropping change subscriber of {client_id}: {err}");
                    false
                }
            }
        });
    }
}
