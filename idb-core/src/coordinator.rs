// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::cmp::max;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::callback_table::{CallbackId, CallbackTable, Continuation};
use crate::connection::{
    ClientConnection, ConnectionId, ConnectionRegistry, DatabaseConnection, OpenRequest, OpenResult,
};
use crate::context::Context;
use crate::error::{ErrorKind, IdbError, IdbResult};
use crate::record::{GetResult, IndexRecordType, KeyData, KeyRange, OverwriteMode};
use crate::schema::{DatabaseInfo, IndexId, IndexInfo, ObjectStoreId, ObjectStoreInfo};
use crate::scope::{scopes_overlap, ScopeCounters};
use crate::storage_thread::{StorageReply, StorageTask};
use crate::transaction::{
    Transaction, TransactionId, TransactionInfo, TransactionMode, TransactionState,
};

/// Commands consumed by the coordinator's run loop. Client-facing entries
/// carry a oneshot continuation; `SchedulerTick` is the coordinator's
/// self-posted wake-up and never runs synchronously within its caller.
pub(crate) enum CoordinatorCommand {
    OpenDatabase {
        client: Arc<dyn ClientConnection>,
        request: OpenRequest,
    },
    CloseConnection {
        connection: ConnectionId,
    },
    CreateTransaction {
        connection: ConnectionId,
        mode: TransactionMode,
        scope: Vec<ObjectStoreId>,
        reply: oneshot::Sender<IdbResult<TransactionInfo>>,
    },
    CreateObjectStore {
        transaction: TransactionId,
        info: ObjectStoreInfo,
        reply: oneshot::Sender<IdbResult<()>>,
    },
    DeleteObjectStore {
        transaction: TransactionId,
        name: String,
        reply: oneshot::Sender<IdbResult<()>>,
    },
    ClearObjectStore {
        transaction: TransactionId,
        object_store: ObjectStoreId,
        reply: oneshot::Sender<IdbResult<()>>,
    },
    CreateIndex {
        transaction: TransactionId,
        info: IndexInfo,
        reply: oneshot::Sender<IdbResult<()>>,
    },
    PutOrAdd {
        transaction: TransactionId,
        object_store: ObjectStoreId,
        key: KeyData,
        value: Bytes,
        mode: OverwriteMode,
        reply: oneshot::Sender<IdbResult<KeyData>>,
    },
    GetRecord {
        transaction: TransactionId,
        object_store: ObjectStoreId,
        index: Option<(IndexId, IndexRecordType)>,
        range: KeyRange,
        reply: oneshot::Sender<IdbResult<GetResult>>,
    },
    GetCount {
        transaction: TransactionId,
        object_store: ObjectStoreId,
        index: Option<IndexId>,
        range: KeyRange,
        reply: oneshot::Sender<IdbResult<u64>>,
    },
    DeleteRecord {
        transaction: TransactionId,
        object_store: ObjectStoreId,
        range: KeyRange,
        reply: oneshot::Sender<IdbResult<()>>,
    },
    CommitTransaction {
        transaction: TransactionId,
        reply: oneshot::Sender<IdbResult<()>>,
    },
    AbortTransaction {
        transaction: TransactionId,
        reply: oneshot::Sender<IdbResult<()>>,
    },
    SchedulerTick,
    Inspect {
        reply: oneshot::Sender<StateSnapshot>,
    },
}

/// One pending `open` call, parked until the backing store is available and
/// no version change is in the way.
struct PendingOpen {
    client: Arc<dyn ClientConnection>,
    request: OpenRequest,
}

/// Point-in-time view of one transaction, exposed through [`StateSnapshot`].
#[derive(Clone, Debug)]
pub struct TransactionSnapshot {
    pub id: TransactionId,
    pub mode: TransactionMode,
    pub state: TransactionState,
    pub scope: Vec<ObjectStoreId>,
}

/// Introspection surface for tests and diagnostics, taken in command order so
/// it doubles as a barrier behind previously issued commands.
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    pub database_info: Option<DatabaseInfo>,
    pub pending_transactions: Vec<TransactionSnapshot>,
    pub in_progress_transactions: Vec<TransactionSnapshot>,
    pub pending_open_requests: usize,
    pub open_connections: usize,
    pub close_pending_connections: usize,
    pub version_change_transaction: Option<TransactionId>,
    /// True while an upgrade open is recorded but its transaction has not
    /// started yet.
    pub version_change_pending: bool,
    pub scope_counters: Vec<(ObjectStoreId, usize)>,
    pub outstanding_callbacks: usize,
}

impl StateSnapshot {
    pub fn version(&self) -> Option<u64> {
        self.database_info.as_ref().map(|info| info.version())
    }

    pub fn is_in_progress(&self, transaction: TransactionId) -> bool {
        self.in_progress_transactions
            .iter()
            .any(|tx| tx.id == transaction)
    }

    pub fn is_active(&self, transaction: TransactionId) -> bool {
        self.in_progress_transactions
            .iter()
            .any(|tx| tx.id == transaction && tx.state == TransactionState::Active)
    }
}

/// The per-database transaction coordinator. Owns every piece of client-facing
/// state and runs as a single task: admission of connections, the
/// version-change protocol, the transaction scheduler, and the correlation of
/// storage replies with their continuations.
pub(crate) struct Coordinator {
    context: Arc<Context>,
    command_receiver: mpsc::UnboundedReceiver<CoordinatorCommand>,
    /// Used to post `SchedulerTick` back onto our own queue. Weak so that the
    /// loop still winds down once the database handle drops its sender.
    self_sender: mpsc::WeakUnboundedSender<CoordinatorCommand>,
    reply_receiver: mpsc::UnboundedReceiver<StorageReply>,
    storage: mpsc::WeakUnboundedSender<StorageTask>,

    /// Cached schema, mutated only by successful storage replies and replaced
    /// wholesale when a version change aborts.
    database_info: Option<DatabaseInfo>,
    /// Latch ensuring only one `OpenBackingStore` task is ever posted.
    backing_store_opening: bool,
    pending_open_requests: VecDeque<PendingOpen>,

    connections: ConnectionRegistry,
    connection_id_counter: u64,
    transaction_id_counter: u64,

    /// Arena of live transactions; connections and the scheduling containers
    /// refer into it by id.
    transactions: HashMap<TransactionId, Transaction>,
    pending_transactions: VecDeque<TransactionId>,
    in_progress_transactions: HashSet<TransactionId>,
    scope_counters: ScopeCounters,

    version_change_operation: Option<PendingOpen>,
    version_change_connection: Option<ConnectionId>,
    /// Holds the upgrading connection between recording it and promoting it
    /// into the open set when the version change starts.
    version_change_connection_record: Option<DatabaseConnection>,
    version_change_transaction: Option<TransactionId>,

    callbacks: CallbackTable,
    scheduler_armed: bool,
}

impl Coordinator {
    pub(crate) fn new(
        context: Arc<Context>,
        command_receiver: mpsc::UnboundedReceiver<CoordinatorCommand>,
        self_sender: mpsc::WeakUnboundedSender<CoordinatorCommand>,
        reply_receiver: mpsc::UnboundedReceiver<StorageReply>,
        storage: mpsc::WeakUnboundedSender<StorageTask>,
    ) -> Self {
        Self {
            context,
            command_receiver,
            self_sender,
            reply_receiver,
            storage,
            database_info: None,
            backing_store_opening: false,
            pending_open_requests: VecDeque::new(),
            connections: ConnectionRegistry::new(),
            connection_id_counter: 0,
            transaction_id_counter: 0,
            transactions: HashMap::new(),
            pending_transactions: VecDeque::new(),
            in_progress_transactions: HashSet::new(),
            scope_counters: ScopeCounters::new(),
            version_change_operation: None,
            version_change_connection: None,
            version_change_connection_record: None,
            version_change_transaction: None,
            callbacks: CallbackTable::new(),
            scheduler_armed: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(database = %self.context.identifier, "coordinator started");
        loop {
            tokio::select! {
                command = self.command_receiver.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(reply) = self.reply_receiver.recv() => self.handle_storage_reply(reply).await,
            }
        }
        info!(database = %self.context.identifier, "coordinator stopped");
    }

    async fn handle_command(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::OpenDatabase { client, request } => {
                self.open_database(client, request).await;
            }
            CoordinatorCommand::CloseConnection { connection } => {
                self.close_connection(connection);
            }
            CoordinatorCommand::CreateTransaction {
                connection,
                mode,
                scope,
                reply,
            } => {
                self.create_transaction(connection, mode, scope, reply);
            }
            CoordinatorCommand::CreateObjectStore {
                transaction,
                info,
                reply,
            } => match self.validate_schema_operation(transaction) {
                Err(error) => {
                    reply.send(Err(error)).ok();
                }
                Ok(()) => {
                    debug!(%transaction, store = %info.name, "create object store");
                    self.post_operation(Continuation::Error(reply), |callback| {
                        StorageTask::CreateObjectStore {
                            callback,
                            transaction,
                            info,
                        }
                    });
                }
            },
            CoordinatorCommand::DeleteObjectStore {
                transaction,
                name,
                reply,
            } => match self.validate_schema_operation(transaction) {
                Err(error) => {
                    reply.send(Err(error)).ok();
                }
                Ok(()) => {
                    debug!(%transaction, store = %name, "delete object store");
                    self.post_operation(Continuation::Error(reply), |callback| {
                        StorageTask::DeleteObjectStore {
                            callback,
                            transaction,
                            name,
                        }
                    });
                }
            },
            CoordinatorCommand::ClearObjectStore {
                transaction,
                object_store,
                reply,
            } => match self.validate_write_operation(transaction, object_store) {
                Err(error) => {
                    reply.send(Err(error)).ok();
                }
                Ok(()) => self.post_operation(Continuation::Error(reply), |callback| {
                    StorageTask::ClearObjectStore {
                        callback,
                        transaction,
                        object_store,
                    }
                }),
            },
            CoordinatorCommand::CreateIndex {
                transaction,
                info,
                reply,
            } => match self.validate_schema_operation(transaction) {
                Err(error) => {
                    reply.send(Err(error)).ok();
                }
                Ok(()) => self.post_operation(Continuation::Error(reply), |callback| {
                    StorageTask::CreateIndex {
                        callback,
                        transaction,
                        info,
                    }
                }),
            },
            CoordinatorCommand::PutOrAdd {
                transaction,
                object_store,
                key,
                value,
                mode,
                reply,
            } => match self.validate_write_operation(transaction, object_store) {
                Err(error) => {
                    reply.send(Err(error)).ok();
                }
                Ok(()) => self.post_operation(Continuation::Key(reply), |callback| {
                    StorageTask::PutOrAdd {
                        callback,
                        transaction,
                        object_store,
                        key,
                        value,
                        mode,
                    }
                }),
            },
            CoordinatorCommand::GetRecord {
                transaction,
                object_store,
                index,
                range,
                reply,
            } => match self.validate_read_operation(transaction, object_store) {
                Err(error) => {
                    reply.send(Err(error)).ok();
                }
                Ok(()) => self.post_operation(Continuation::Get(reply), |callback| {
                    StorageTask::GetRecord {
                        callback,
                        transaction,
                        object_store,
                        index,
                        range,
                    }
                }),
            },
            CoordinatorCommand::GetCount {
                transaction,
                object_store,
                index,
                range,
                reply,
            } => match self.validate_read_operation(transaction, object_store) {
                Err(error) => {
                    reply.send(Err(error)).ok();
                }
                Ok(()) => self.post_operation(Continuation::Count(reply), |callback| {
                    StorageTask::GetCount {
                        callback,
                        transaction,
                        object_store,
                        index,
                        range,
                    }
                }),
            },
            CoordinatorCommand::DeleteRecord {
                transaction,
                object_store,
                range,
                reply,
            } => match self.validate_write_operation(transaction, object_store) {
                Err(error) => {
                    reply.send(Err(error)).ok();
                }
                Ok(()) => self.post_operation(Continuation::Error(reply), |callback| {
                    StorageTask::DeleteRecord {
                        callback,
                        transaction,
                        object_store,
                        range,
                    }
                }),
            },
            CoordinatorCommand::CommitTransaction { transaction, reply } => {
                self.commit_transaction(transaction, reply);
            }
            CoordinatorCommand::AbortTransaction { transaction, reply } => {
                self.abort_transaction(transaction, reply);
            }
            CoordinatorCommand::SchedulerTick => {
                self.scheduler_tick().await;
            }
            CoordinatorCommand::Inspect { reply } => {
                reply.send(self.snapshot()).ok();
            }
        }
    }

    // ---- open protocol ----

    async fn open_database(&mut self, client: Arc<dyn ClientConnection>, request: OpenRequest) {
        debug!(requested = request.requested_version, "open database");
        self.pending_open_requests
            .push_back(PendingOpen { client, request });
        if self.database_info.is_some() {
            self.handle_open_requests().await;
        } else if !self.backing_store_opening {
            self.backing_store_opening = true;
            self.post_storage_task(StorageTask::OpenBackingStore);
        }
    }

    /// Services queued open requests until the queue drains or an upgrade
    /// takes over. While a version change is recorded or running no new
    /// connection can be opened; the scheduler re-enters this on completion.
    async fn handle_open_requests(&mut self) {
        loop {
            if self.version_change_connection.is_some() {
                return;
            }
            let Some(current_version) = self.database_info.as_ref().map(|info| info.version())
            else {
                return;
            };
            let Some(operation) = self.pending_open_requests.pop_front() else {
                return;
            };

            let mut requested = operation.request.requested_version;
            if requested == 0 {
                requested = max(current_version, 1);
            }

            if requested < current_version {
                debug!(
                    requested,
                    current_version, "refusing open below current version"
                );
                self.note_error_kind(ErrorKind::VersionError);
                operation
                    .client
                    .did_open_database(
                        operation.request.request,
                        OpenResult::Error(IdbError::with_message(
                            ErrorKind::VersionError,
                            "requested version is below the current version",
                        )),
                    )
                    .await;
                continue;
            }

            let connection_id = self.next_connection_id();
            let connection = DatabaseConnection::new(connection_id, operation.client.clone());

            if requested == current_version {
                self.connections.add_open(connection);
                self.update_gauges();
                let info = self.database_info.clone().expect("schema is cached");
                info!(connection = %connection_id, version = current_version, "database opened");
                operation
                    .client
                    .did_open_database(
                        operation.request.request,
                        OpenResult::Success {
                            connection: connection_id,
                            info,
                        },
                    )
                    .await;
                continue;
            }

            // Upgrade path: record the request and the new connection, then
            // either start right away or wait for the other connections to
            // close.
            debug_assert!(self.version_change_operation.is_none());
            info!(connection = %connection_id, requested, "version change requested");
            self.version_change_connection = Some(connection_id);
            self.version_change_connection_record = Some(connection);
            self.version_change_operation = Some(operation);

            if self.connections.has_any_open() {
                self.notify_connections_of_version_change().await;
            } else if self.in_progress_transactions.is_empty()
                && self.pending_transactions.is_empty()
            {
                self.start_version_change_transaction().await;
            }
            // Otherwise close-pending connections still hold transactions;
            // the scheduler re-checks when they complete.
            return;
        }
    }

    async fn start_version_change_transaction(&mut self) {
        debug_assert!(self.version_change_transaction.is_none());
        let operation = self
            .version_change_operation
            .take()
            .expect("a version change operation is recorded");
        let mut connection = self
            .version_change_connection_record
            .take()
            .expect("a version change connection is recorded");
        let connection_id = connection.id();
        debug_assert_eq!(self.version_change_connection, Some(connection_id));

        let current_version = self
            .database_info
            .as_ref()
            .expect("schema is cached before upgrades start")
            .version();
        let mut requested = operation.request.requested_version;
        if requested == 0 {
            requested = max(current_version, 1);
        }

        let transaction_id = self.next_transaction_id();
        let transaction_info = TransactionInfo::version_change(transaction_id, requested);

        // The cache holds the new version speculatively; the transaction
        // keeps the original schema for rollback.
        let original = self.database_info.clone().expect("schema is cached");
        self.database_info
            .as_mut()
            .expect("schema is cached")
            .set_version(requested);

        connection.add_transaction(transaction_id);
        self.connections.add_open(connection);

        let mut transaction =
            Transaction::version_change(transaction_info.clone(), connection_id, original);
        transaction.set_state(TransactionState::Activating);
        self.transactions.insert(transaction_id, transaction);
        self.in_progress_transactions.insert(transaction_id);
        self.version_change_transaction = Some(transaction_id);
        self.update_gauges();

        info!(transaction = %transaction_id, version = requested, "starting version change transaction");
        self.post_storage_task(StorageTask::BeginTransaction {
            info: transaction_info.clone(),
        });

        operation
            .client
            .did_open_database(
                operation.request.request,
                OpenResult::UpgradeNeeded {
                    connection: connection_id,
                    transaction: transaction_info,
                },
            )
            .await;
    }

    /// Fires a "versionchange" event at every open connection whose close is
    /// not already pending. The upgrade then waits for them to close.
    async fn notify_connections_of_version_change(&mut self) {
        let operation = self
            .version_change_operation
            .as_ref()
            .expect("a version change operation is recorded");
        let requested = operation.request.requested_version;
        debug!(requested, "notifying connections of version change");

        let recipients: Vec<(ConnectionId, Arc<dyn ClientConnection>)> = self
            .connections
            .iter_open()
            .filter(|connection| !connection.close_pending())
            .map(|connection| (connection.id(), connection.client()))
            .collect();
        for (connection_id, client) in recipients {
            client
                .fire_version_change_event(connection_id, requested)
                .await;
        }
    }

    // ---- connection registry ----

    fn close_connection(&mut self, connection: ConnectionId) {
        debug!(%connection, "connection closed from client");

        if self.version_change_connection == Some(connection) {
            self.version_change_connection = None;
            self.version_change_connection_record = None;
        }

        let Some(mut removed) = self.connections.take_open(connection) else {
            warn!(%connection, "close for a connection that is not open");
            return;
        };
        removed.set_close_pending();

        if removed.has_unfinished_transactions() {
            // Protocol wart: the client went away with transactions it never
            // committed or aborted. Keep the connection until they resolve.
            warn!(
                %connection,
                transactions = removed.unfinished_transaction_count(),
                "connection closed with unfinished transactions"
            );
            self.connections.add_close_pending(removed);
        } else {
            info!(%connection, "connection closed");
        }
        self.update_gauges();

        // Previously blocked version changes or writers may be runnable now.
        self.invoke_scheduler();
    }

    // ---- transaction lifecycle ----

    fn create_transaction(
        &mut self,
        connection: ConnectionId,
        mode: TransactionMode,
        mut scope: Vec<ObjectStoreId>,
        reply: oneshot::Sender<IdbResult<TransactionInfo>>,
    ) {
        if mode == TransactionMode::VersionChange {
            reply
                .send(Err(IdbError::with_message(
                    ErrorKind::InvalidStateError,
                    "version change transactions are started by the open protocol",
                )))
                .ok();
            return;
        }
        let Some(owner) = self.connections.open_mut(connection) else {
            reply
                .send(Err(IdbError::with_message(
                    ErrorKind::InvalidStateError,
                    "connection is not open",
                )))
                .ok();
            return;
        };

        scope.sort();
        scope.dedup();
        self.transaction_id_counter += 1;
        let transaction_id = TransactionId(self.transaction_id_counter);
        let info = TransactionInfo::new(transaction_id, mode, scope);
        owner.add_transaction(transaction_id);
        self.transactions
            .insert(transaction_id, Transaction::new(info.clone(), connection));
        self.pending_transactions.push_back(transaction_id);
        self.update_gauges();
        debug!(transaction = %transaction_id, ?mode, "transaction enqueued");

        self.invoke_scheduler();
        reply.send(Ok(info)).ok();
    }

    fn commit_transaction(
        &mut self,
        transaction: TransactionId,
        reply: oneshot::Sender<IdbResult<()>>,
    ) {
        match self.operation_transaction(transaction) {
            Err(error) => {
                reply.send(Err(error)).ok();
                return;
            }
            Ok(_) => {}
        }
        debug!(%transaction, "commit transaction");

        if self.version_change_transaction == Some(transaction) {
            let new_version = self
                .transactions
                .get(&transaction)
                .and_then(|tx| tx.info().new_version)
                .expect("version change transactions carry a new version");
            self.database_info
                .as_mut()
                .expect("schema is cached")
                .set_version(new_version);
            self.version_change_transaction = None;
            self.version_change_connection = None;
        }

        let tx = self
            .transactions
            .get_mut(&transaction)
            .expect("validated above");
        tx.set_state(TransactionState::Committing);

        let callback = self.callbacks.store(Continuation::Error(reply));
        self.post_storage_task(StorageTask::CommitTransaction {
            callback,
            transaction,
        });
    }

    fn abort_transaction(
        &mut self,
        transaction: TransactionId,
        reply: oneshot::Sender<IdbResult<()>>,
    ) {
        match self.operation_transaction(transaction) {
            Err(error) => {
                reply.send(Err(error)).ok();
                return;
            }
            Ok(_) => {}
        }
        debug!(%transaction, "abort transaction");

        let tx = self
            .transactions
            .get_mut(&transaction)
            .expect("validated above");
        tx.set_state(TransactionState::Aborting);

        let callback = self.callbacks.store(Continuation::Error(reply));
        self.post_storage_task(StorageTask::AbortTransaction {
            callback,
            transaction,
        });
    }

    /// Removes a finished transaction from every container that references
    /// it. A transaction finishes exactly once; a second completion for the
    /// same id is a programming error.
    fn in_progress_transaction_completed(&mut self, transaction: TransactionId) {
        assert!(
            self.in_progress_transactions.remove(&transaction),
            "transaction {transaction} reported complete twice"
        );
        if self.version_change_transaction == Some(transaction) {
            self.version_change_transaction = None;
        }

        let mut tx = self
            .transactions
            .remove(&transaction)
            .expect("completed transaction is in the arena");
        tx.set_state(TransactionState::Completed);
        self.scope_counters.release(tx.scope());

        let connection = tx.connection();
        if let Some(owner) = self.connections.connection_mut(connection) {
            owner.remove_transaction(transaction);
        }
        if self.connections.release_if_finished(connection) {
            info!(%connection, "released close-pending connection");
        }
        self.update_gauges();

        // Previously blocked transactions might now be unblocked.
        self.invoke_scheduler();
    }

    // ---- scheduler ----

    /// Arms the scheduler wake-up. Coalesced: while armed, further wake-ups
    /// are no-ops. The tick always runs on a later turn of the command loop,
    /// never synchronously within the caller.
    fn invoke_scheduler(&mut self) {
        if self.scheduler_armed {
            return;
        }
        match self.self_sender.upgrade() {
            Some(sender) => {
                self.scheduler_armed = true;
                sender.send(CoordinatorCommand::SchedulerTick).ok();
            }
            None => warn!("scheduler wake-up dropped during shutdown"),
        }
    }

    async fn scheduler_tick(&mut self) {
        self.scheduler_armed = false;
        self.context.metrics.scheduler_ticks.inc();

        // A recorded version change starts once the last connection is gone
        // and every in-progress transaction has finished.
        if self.pending_transactions.is_empty()
            && !self.connections.has_any_open()
            && self.version_change_operation.is_some()
            && self.in_progress_transactions.is_empty()
        {
            self.start_version_change_transaction().await;
            return;
        }

        // Opens deferred behind a finished version change can proceed now.
        self.handle_open_requests().await;

        // A running version change excludes every other transaction.
        if self.version_change_transaction.is_some() {
            return;
        }

        let mut had_deferred = false;
        if let Some(transaction_id) = self.take_next_runnable_transaction(&mut had_deferred) {
            let tx = self
                .transactions
                .get_mut(&transaction_id)
                .expect("pending transactions are in the arena");
            tx.set_state(TransactionState::Activating);
            let info = tx.info().clone();

            self.scope_counters.add(&info.scope);
            self.in_progress_transactions.insert(transaction_id);
            self.update_gauges();

            debug!(transaction = %transaction_id, "activating transaction");
            self.post_storage_task(StorageTask::BeginTransaction { info });

            // If nothing was deferred, another transaction may be runnable
            // right away.
            if !had_deferred {
                self.invoke_scheduler();
            }
        }
    }

    /// Scans the pending queue for the first transaction whose scope rules
    /// allow it to run. Deferred transactions are prepended back in their
    /// original order. A read-only transaction may not leapfrog the
    /// head-of-line blocked writer it overlaps with, which keeps writers from
    /// starving.
    fn take_next_runnable_transaction(&mut self, had_deferred: &mut bool) -> Option<TransactionId> {
        let mut deferred: VecDeque<TransactionId> = VecDeque::new();
        let mut runnable = None;

        while let Some(transaction_id) = self.pending_transactions.pop_front() {
            let tx = self
                .transactions
                .get(&transaction_id)
                .expect("pending transactions are in the arena");
            match tx.mode() {
                TransactionMode::ReadWrite => {
                    // A writer overlapping any running transaction must wait.
                    if self.scope_counters.overlaps(tx.scope()) {
                        deferred.push_back(transaction_id);
                        continue;
                    }
                }
                TransactionMode::ReadOnly => {
                    // The first deferred transaction is a blocked writer. A
                    // reader overlapping it has to queue behind it.
                    if let Some(&blocked_writer) = deferred.front() {
                        let writer = self
                            .transactions
                            .get(&blocked_writer)
                            .expect("deferred transactions are in the arena");
                        debug_assert_eq!(writer.mode(), TransactionMode::ReadWrite);
                        if scopes_overlap(writer.scope(), tx.scope()) {
                            deferred.push_back(transaction_id);
                            continue;
                        }
                    }
                }
                TransactionMode::VersionChange => {
                    panic!("version change transaction in the scheduler queue")
                }
            }
            runnable = Some(transaction_id);
            break;
        }

        *had_deferred = !deferred.is_empty();
        while let Some(transaction_id) = deferred.pop_back() {
            self.pending_transactions.push_front(transaction_id);
        }
        runnable
    }

    // ---- storage replies ----

    async fn handle_storage_reply(&mut self, reply: StorageReply) {
        self.context.metrics.storage_replies.inc();
        match reply {
            StorageReply::DidOpenBackingStore { result } => {
                self.backing_store_opening = false;
                match result {
                    Ok(info) => {
                        info!(version = info.version(), "backing store opened");
                        self.database_info = Some(info);
                        self.handle_open_requests().await;
                    }
                    Err(error) => {
                        warn!(%error, "backing store failed to open");
                        self.note_error_kind(error.kind());
                        while let Some(operation) = self.pending_open_requests.pop_front() {
                            operation
                                .client
                                .did_open_database(
                                    operation.request.request,
                                    OpenResult::Error(error.clone()),
                                )
                                .await;
                        }
                    }
                }
            }
            StorageReply::DidBeginTransaction {
                transaction,
                result,
            } => {
                let Some(tx) = self.transactions.get_mut(&transaction) else {
                    warn!(%transaction, "begin reply for an unknown transaction");
                    return;
                };
                tx.set_state(TransactionState::Active);
                let connection = tx.connection();
                debug!(%transaction, "transaction active");

                let client = self
                    .connections
                    .connection_mut(connection)
                    .map(|owner| owner.client());
                if let Some(client) = client {
                    client.did_start_transaction(transaction, result).await;
                }
                self.invoke_scheduler();
            }
            StorageReply::DidCreateObjectStore {
                callback,
                result,
                info,
            } => {
                if result.is_ok() {
                    self.database_info
                        .as_mut()
                        .expect("schema is cached")
                        .add_existing_object_store(info);
                }
                self.complete_error_callback(callback, result);
            }
            StorageReply::DidDeleteObjectStore {
                callback,
                result,
                name,
            } => {
                if result.is_ok() {
                    self.database_info
                        .as_mut()
                        .expect("schema is cached")
                        .delete_object_store(&name);
                }
                self.complete_error_callback(callback, result);
            }
            StorageReply::DidClearObjectStore { callback, result } => {
                self.complete_error_callback(callback, result);
            }
            StorageReply::DidCreateIndex {
                callback,
                result,
                info,
            } => {
                if result.is_ok() {
                    self.database_info
                        .as_mut()
                        .expect("schema is cached")
                        .object_store_mut(info.object_store)
                        .expect("object store of the created index exists")
                        .add_existing_index(info);
                }
                self.complete_error_callback(callback, result);
            }
            StorageReply::DidPutOrAdd { callback, result } => {
                if let Err(error) = &result {
                    self.note_error_kind(error.kind());
                }
                self.callbacks.complete_key(callback, result);
            }
            StorageReply::DidGetRecord { callback, result } => {
                if let Err(error) = &result {
                    self.note_error_kind(error.kind());
                }
                self.callbacks.complete_get(callback, result);
            }
            StorageReply::DidGetCount { callback, result } => {
                if let Err(error) = &result {
                    self.note_error_kind(error.kind());
                }
                self.callbacks.complete_count(callback, result);
            }
            StorageReply::DidDeleteRecord { callback, result } => {
                self.complete_error_callback(callback, result);
            }
            StorageReply::DidCommitTransaction {
                callback,
                transaction,
                result,
            } => {
                debug!(%transaction, "transaction committed");
                self.in_progress_transaction_completed(transaction);
                self.complete_error_callback(callback, result);
            }
            StorageReply::DidAbortTransaction {
                callback,
                transaction,
                result,
            } => {
                debug!(%transaction, "transaction aborted");
                if self.version_change_transaction == Some(transaction) {
                    // Roll the cached schema back to the snapshot taken when
                    // the upgrade started.
                    let original = self
                        .transactions
                        .get(&transaction)
                        .and_then(|tx| tx.original_database_info())
                        .expect("version change transactions keep the original schema")
                        .clone();
                    self.database_info = Some(original);
                    self.version_change_transaction = None;
                    self.version_change_connection = None;
                }
                self.in_progress_transaction_completed(transaction);
                self.complete_error_callback(callback, result);
            }
        }
    }

    // ---- helpers ----

    fn next_connection_id(&mut self) -> ConnectionId {
        self.connection_id_counter += 1;
        ConnectionId(self.connection_id_counter)
    }

    fn next_transaction_id(&mut self) -> TransactionId {
        self.transaction_id_counter += 1;
        TransactionId(self.transaction_id_counter)
    }

    fn post_storage_task(&mut self, task: StorageTask) {
        self.context.metrics.storage_tasks.inc();
        match self.storage.upgrade() {
            Some(sender) => {
                if sender.send(task).is_err() {
                    warn!("storage thread stopped, dropping task");
                }
            }
            None => warn!("storage thread gone, dropping task"),
        }
    }

    fn post_operation(
        &mut self,
        continuation: Continuation,
        make_task: impl FnOnce(CallbackId) -> StorageTask,
    ) {
        let callback = self.callbacks.store(continuation);
        self.post_storage_task(make_task(callback));
    }

    fn complete_error_callback(&mut self, callback: CallbackId, result: IdbResult<()>) {
        if let Err(error) = &result {
            self.note_error_kind(error.kind());
        }
        self.callbacks.complete_error(callback, result);
    }

    fn note_error_kind(&self, kind: ErrorKind) {
        self.context
            .metrics
            .operation_errors
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    /// A transaction may receive operations from the moment its begin task is
    /// queued until it starts committing or aborting.
    fn operation_transaction(&self, transaction: TransactionId) -> IdbResult<&Transaction> {
        let tx = self.transactions.get(&transaction).ok_or_else(|| {
            IdbError::with_message(
                ErrorKind::InvalidStateError,
                format!("unknown transaction {transaction}"),
            )
        })?;
        match tx.state() {
            TransactionState::Activating | TransactionState::Active => Ok(tx),
            _ => Err(IdbError::with_message(
                ErrorKind::InvalidStateError,
                format!("transaction {transaction} is not active"),
            )),
        }
    }

    fn validate_schema_operation(&self, transaction: TransactionId) -> IdbResult<()> {
        let tx = self.operation_transaction(transaction)?;
        if tx.mode() != TransactionMode::VersionChange {
            return Err(IdbError::with_message(
                ErrorKind::InvalidStateError,
                "schema changes require a version change transaction",
            ));
        }
        Ok(())
    }

    fn validate_write_operation(
        &self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
    ) -> IdbResult<()> {
        let tx = self.operation_transaction(transaction)?;
        match tx.mode() {
            TransactionMode::VersionChange => Ok(()),
            TransactionMode::ReadWrite if tx.scope().contains(&object_store) => Ok(()),
            TransactionMode::ReadWrite => Err(IdbError::with_message(
                ErrorKind::InvalidStateError,
                "object store is outside the transaction scope",
            )),
            TransactionMode::ReadOnly => Err(IdbError::with_message(
                ErrorKind::InvalidStateError,
                "write in a read-only transaction",
            )),
        }
    }

    fn validate_read_operation(
        &self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
    ) -> IdbResult<()> {
        let tx = self.operation_transaction(transaction)?;
        if tx.mode() == TransactionMode::VersionChange || tx.scope().contains(&object_store) {
            Ok(())
        } else {
            Err(IdbError::with_message(
                ErrorKind::InvalidStateError,
                "object store is outside the transaction scope",
            ))
        }
    }

    fn update_gauges(&self) {
        let metrics = &self.context.metrics;
        metrics
            .pending_transactions
            .set(self.pending_transactions.len() as i64);
        metrics
            .in_progress_transactions
            .set(self.in_progress_transactions.len() as i64);
        metrics
            .open_connections
            .set(self.connections.open_count() as i64);
        metrics
            .close_pending_connections
            .set(self.connections.close_pending_count() as i64);
    }

    fn transaction_snapshot(&self, transaction: TransactionId) -> TransactionSnapshot {
        let tx = self
            .transactions
            .get(&transaction)
            .expect("snapshot of a transaction in the arena");
        TransactionSnapshot {
            id: transaction,
            mode: tx.mode(),
            state: tx.state(),
            scope: tx.scope().to_vec(),
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        let pending = self
            .pending_transactions
            .iter()
            .map(|id| self.transaction_snapshot(*id))
            .collect();
        let mut in_progress: Vec<_> = self
            .in_progress_transactions
            .iter()
            .map(|id| self.transaction_snapshot(*id))
            .collect();
        in_progress.sort_by_key(|tx| tx.id);

        StateSnapshot {
            database_info: self.database_info.clone(),
            pending_transactions: pending,
            in_progress_transactions: in_progress,
            pending_open_requests: self.pending_open_requests.len(),
            open_connections: self.connections.open_count(),
            close_pending_connections: self.connections.close_pending_count(),
            version_change_transaction: self.version_change_transaction,
            version_change_pending: self.version_change_operation.is_some(),
            scope_counters: self.scope_counters.snapshot(),
            outstanding_callbacks: self.callbacks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::connection::test_client::TestClient;
    use crate::connection::RequestId;

    struct Harness {
        coordinator: Coordinator,
        storage_tasks: mpsc::UnboundedReceiver<StorageTask>,
        _storage_sender: mpsc::UnboundedSender<StorageTask>,
        _command_sender: mpsc::UnboundedSender<CoordinatorCommand>,
        initial_info: DatabaseInfo,
        /// Transactions in the order their begin tasks reached storage.
        begun: Vec<TransactionId>,
    }

    fn harness(initial_info: DatabaseInfo) -> Harness {
        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (_reply_sender, reply_receiver) = mpsc::unbounded_channel();
        let (storage_sender, storage_tasks) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(
            Arc::new(Context::new_for_test()),
            command_receiver,
            command_sender.downgrade(),
            reply_receiver,
            storage_sender.downgrade(),
        );
        Harness {
            coordinator,
            storage_tasks,
            _storage_sender: storage_sender,
            _command_sender: command_sender,
            initial_info,
            begun: Vec::new(),
        }
    }

    fn schema_with_stores(
        version: u64,
        names: &[&str],
    ) -> (DatabaseInfo, Vec<ObjectStoreId>) {
        let mut info = DatabaseInfo::new(version);
        let mut ids = Vec::new();
        for name in names {
            let store = info.create_new_object_store(*name, None, false);
            ids.push(store.id);
            info.add_existing_object_store(store);
        }
        (info, ids)
    }

    fn assert_invariants(coordinator: &Coordinator) {
        // At most one in-progress writer per object store, and the scope
        // counters match exactly what the in-progress set contributed.
        let mut writers: HashMap<ObjectStoreId, usize> = HashMap::new();
        let mut expected_counts: HashMap<ObjectStoreId, usize> = HashMap::new();
        for id in &coordinator.in_progress_transactions {
            let tx = &coordinator.transactions[id];
            for store in tx.scope() {
                *expected_counts.entry(*store).or_default() += 1;
                if tx.mode() == TransactionMode::ReadWrite {
                    *writers.entry(*store).or_default() += 1;
                }
            }
        }
        for (store, count) in &writers {
            assert!(*count <= 1, "store {store} is scoped by {count} writers");
        }
        let mut expected: Vec<_> = expected_counts.into_iter().collect();
        expected.sort();
        assert_eq!(coordinator.scope_counters.snapshot(), expected);

        // A running version change excludes everything else.
        if let Some(vc) = coordinator.version_change_transaction {
            assert_eq!(coordinator.in_progress_transactions.len(), 1);
            assert!(coordinator.in_progress_transactions.contains(&vc));
            assert!(coordinator.connections.open_count() <= 1);
            assert!(coordinator.pending_transactions.is_empty());
        }
    }

    impl Harness {
        /// Drains self-posted scheduler ticks and answers storage tasks with
        /// canned successful replies until the coordinator is quiescent.
        async fn settle(&mut self) {
            loop {
                let mut progressed = false;
                while let Ok(command) = self.coordinator.command_receiver.try_recv() {
                    progressed = true;
                    self.coordinator.handle_command(command).await;
                }
                while let Ok(task) = self.storage_tasks.try_recv() {
                    progressed = true;
                    let reply = match task {
                        StorageTask::OpenBackingStore => StorageReply::DidOpenBackingStore {
                            result: Ok(self.initial_info.clone()),
                        },
                        StorageTask::BeginTransaction { info } => {
                            self.begun.push(info.id);
                            StorageReply::DidBeginTransaction {
                                transaction: info.id,
                                result: Ok(()),
                            }
                        }
                        StorageTask::CreateObjectStore { callback, info, .. } => {
                            StorageReply::DidCreateObjectStore {
                                callback,
                                result: Ok(()),
                                info,
                            }
                        }
                        StorageTask::DeleteObjectStore { callback, name, .. } => {
                            StorageReply::DidDeleteObjectStore {
                                callback,
                                result: Ok(()),
                                name,
                            }
                        }
                        StorageTask::CreateIndex { callback, info, .. } => {
                            StorageReply::DidCreateIndex {
                                callback,
                                result: Ok(()),
                                info,
                            }
                        }
                        StorageTask::CommitTransaction {
                            callback,
                            transaction,
                        } => StorageReply::DidCommitTransaction {
                            callback,
                            transaction,
                            result: Ok(()),
                        },
                        StorageTask::AbortTransaction {
                            callback,
                            transaction,
                        } => StorageReply::DidAbortTransaction {
                            callback,
                            transaction,
                            result: Ok(()),
                        },
                        _ => panic!("unexpected storage task in scheduler tests"),
                    };
                    self.coordinator.handle_storage_reply(reply).await;
                    assert_invariants(&self.coordinator);
                }
                if !progressed {
                    break;
                }
            }
            assert_invariants(&self.coordinator);
        }

        async fn open(&mut self, client: &Arc<TestClient>, request: u64, version: u64) {
            self.coordinator
                .handle_command(CoordinatorCommand::OpenDatabase {
                    client: client.clone(),
                    request: OpenRequest {
                        request: RequestId(request),
                        requested_version: version,
                    },
                })
                .await;
            self.settle().await;
        }

        async fn open_success(
            &mut self,
            client: &Arc<TestClient>,
            request: u64,
            version: u64,
        ) -> ConnectionId {
            self.open(client, request, version).await;
            match client.wait_for_open(RequestId(request)).await {
                OpenResult::Success { connection, .. } => connection,
                other => panic!("expected an open success, got {other:?}"),
            }
        }

        async fn create_transaction(
            &mut self,
            connection: ConnectionId,
            mode: TransactionMode,
            scope: Vec<ObjectStoreId>,
        ) -> TransactionInfo {
            let (reply, mut receiver) = oneshot::channel();
            self.coordinator
                .handle_command(CoordinatorCommand::CreateTransaction {
                    connection,
                    mode,
                    scope,
                    reply,
                })
                .await;
            self.settle().await;
            receiver.try_recv().unwrap().unwrap()
        }

        async fn commit(&mut self, transaction: TransactionId) -> IdbResult<()> {
            let (reply, mut receiver) = oneshot::channel();
            self.coordinator
                .handle_command(CoordinatorCommand::CommitTransaction { transaction, reply })
                .await;
            self.settle().await;
            receiver.try_recv().unwrap()
        }

        async fn abort(&mut self, transaction: TransactionId) -> IdbResult<()> {
            let (reply, mut receiver) = oneshot::channel();
            self.coordinator
                .handle_command(CoordinatorCommand::AbortTransaction { transaction, reply })
                .await;
            self.settle().await;
            receiver.try_recv().unwrap()
        }

        async fn close(&mut self, connection: ConnectionId) {
            self.coordinator
                .handle_command(CoordinatorCommand::CloseConnection { connection })
                .await;
            self.settle().await;
        }
    }

    #[tokio::test]
    async fn fresh_open_upgrades_creates_store_and_commits() {
        let mut h = harness(DatabaseInfo::new(0));
        let client = TestClient::new();
        h.open(&client, 1, 2).await;

        let OpenResult::UpgradeNeeded { transaction, .. } =
            client.wait_for_open(RequestId(1)).await
        else {
            panic!("expected an upgrade");
        };
        assert_eq!(transaction.mode, TransactionMode::VersionChange);
        assert_eq!(transaction.new_version, Some(2));
        assert_eq!(
            h.coordinator.version_change_transaction,
            Some(transaction.id)
        );

        let store = h
            .coordinator
            .database_info
            .as_mut()
            .unwrap()
            .create_new_object_store("s", None, true);
        let (reply, mut receiver) = oneshot::channel();
        h.coordinator
            .handle_command(CoordinatorCommand::CreateObjectStore {
                transaction: transaction.id,
                info: store,
                reply,
            })
            .await;
        h.settle().await;
        assert_eq!(receiver.try_recv().unwrap(), Ok(()));
        let info = h.coordinator.database_info.as_ref().unwrap();
        assert!(info.has_object_store_named("s"));
        assert!(info.object_store_named("s").unwrap().auto_increment);

        h.commit(transaction.id).await.unwrap();
        assert_eq!(h.coordinator.database_info.as_ref().unwrap().version(), 2);
        assert!(h.coordinator.version_change_transaction.is_none());
        assert!(h.coordinator.in_progress_transactions.is_empty());
    }

    #[tokio::test]
    async fn fresh_open_with_default_version_upgrades_to_one() {
        let mut h = harness(DatabaseInfo::new(0));
        let client = TestClient::new();
        h.open(&client, 1, 0).await;

        // Requested version 0 on a fresh database resolves to 1.
        let OpenResult::UpgradeNeeded { transaction, .. } =
            client.wait_for_open(RequestId(1)).await
        else {
            panic!("expected an upgrade");
        };
        assert_eq!(transaction.new_version, Some(1));

        h.commit(transaction.id).await.unwrap();
        assert_eq!(h.coordinator.database_info.as_ref().unwrap().version(), 1);
    }

    #[tokio::test]
    async fn open_below_current_version_is_refused() {
        let mut h = harness(DatabaseInfo::new(5));
        let client = TestClient::new();
        h.open(&client, 1, 3).await;

        match client.wait_for_open(RequestId(1)).await {
            OpenResult::Error(error) => assert_eq!(error.kind(), ErrorKind::VersionError),
            other => panic!("expected a version error, got {other:?}"),
        }
        // The refusal is synthesized on the main context; storage never saw a
        // transaction.
        assert!(h.begun.is_empty());

        // Requested version 0 resolves to the current version.
        let connection = h.open_success(&client, 2, 0).await;
        let events = client.events();
        assert!(matches!(
            events.last(),
            Some(crate::connection::test_client::ClientEvent::Opened(
                _,
                OpenResult::Success { info, .. }
            )) if info.version() == 5
        ));
        let _ = connection;
    }

    #[tokio::test]
    async fn readers_run_concurrently_writers_are_exclusive() {
        let (info, ids) = schema_with_stores(1, &["a", "b"]);
        let (a, b) = (ids[0], ids[1]);
        let mut h = harness(info);
        let client = TestClient::new();
        let connection = h.open_success(&client, 1, 1).await;

        let t1 = h
            .create_transaction(connection, TransactionMode::ReadOnly, vec![a])
            .await;
        let t2 = h
            .create_transaction(connection, TransactionMode::ReadOnly, vec![b])
            .await;
        let t3 = h
            .create_transaction(connection, TransactionMode::ReadWrite, vec![a])
            .await;

        // Both readers are running; the writer overlaps t1 and waits.
        assert_eq!(h.begun, vec![t1.id, t2.id]);
        assert!(h.coordinator.pending_transactions.contains(&t3.id));

        h.commit(t1.id).await.unwrap();
        assert_eq!(h.begun, vec![t1.id, t2.id, t3.id]);

        h.commit(t2.id).await.unwrap();
        h.commit(t3.id).await.unwrap();
        assert!(h.coordinator.in_progress_transactions.is_empty());
        assert!(h.coordinator.transactions.is_empty());
        assert!(h.coordinator.scope_counters.is_empty());
    }

    #[tokio::test]
    async fn readers_do_not_leapfrog_a_blocked_writer() {
        let (info, ids) = schema_with_stores(1, &["a"]);
        let a = ids[0];
        let mut h = harness(info);
        let client = TestClient::new();
        let connection = h.open_success(&client, 1, 1).await;

        let t1 = h
            .create_transaction(connection, TransactionMode::ReadWrite, vec![a])
            .await;
        let t2 = h
            .create_transaction(connection, TransactionMode::ReadWrite, vec![a])
            .await;
        let t3 = h
            .create_transaction(connection, TransactionMode::ReadOnly, vec![a])
            .await;

        assert_eq!(h.begun, vec![t1.id]);

        h.commit(t1.id).await.unwrap();
        // The reader queued after the writer must not bypass it.
        assert_eq!(h.begun, vec![t1.id, t2.id]);
        assert!(h.coordinator.pending_transactions.contains(&t3.id));

        h.commit(t2.id).await.unwrap();
        assert_eq!(h.begun, vec![t1.id, t2.id, t3.id]);
        h.commit(t3.id).await.unwrap();
    }

    #[tokio::test]
    async fn readers_pass_writers_with_disjoint_scopes() {
        let (info, ids) = schema_with_stores(1, &["a", "b"]);
        let (a, b) = (ids[0], ids[1]);
        let mut h = harness(info);
        let client = TestClient::new();
        let connection = h.open_success(&client, 1, 1).await;

        let t1 = h
            .create_transaction(connection, TransactionMode::ReadWrite, vec![a])
            .await;
        let t2 = h
            .create_transaction(connection, TransactionMode::ReadWrite, vec![a])
            .await;
        let t3 = h
            .create_transaction(connection, TransactionMode::ReadOnly, vec![b])
            .await;

        // t2 waits behind t1, but the reader's scope is disjoint from the
        // blocked writer's and may run.
        assert_eq!(h.begun, vec![t1.id, t3.id]);
        assert!(h.coordinator.pending_transactions.contains(&t2.id));

        h.commit(t1.id).await.unwrap();
        h.commit(t2.id).await.unwrap();
        h.commit(t3.id).await.unwrap();
    }

    #[tokio::test]
    async fn disjoint_writers_activate_together() {
        let (info, ids) = schema_with_stores(1, &["a", "b"]);
        let mut h = harness(info);
        let client = TestClient::new();
        let connection = h.open_success(&client, 1, 1).await;

        let t1 = h
            .create_transaction(connection, TransactionMode::ReadWrite, vec![ids[0]])
            .await;
        let t2 = h
            .create_transaction(connection, TransactionMode::ReadWrite, vec![ids[1]])
            .await;
        assert_eq!(h.begun, vec![t1.id, t2.id]);

        h.commit(t1.id).await.unwrap();
        h.commit(t2.id).await.unwrap();
    }

    #[tokio::test]
    async fn upgrade_waits_for_other_connections_to_close() {
        let mut h = harness(DatabaseInfo::new(1));
        let c1 = TestClient::new();
        let c2 = TestClient::new();

        let first = h.open_success(&c1, 1, 1).await;
        h.open(&c2, 2, 2).await;

        // C1 was told about the version change; C2 is still waiting.
        c1.wait_for(|events| {
            events.iter().any(|event| {
                matches!(
                    event,
                    crate::connection::test_client::ClientEvent::VersionChange(_, 2)
                )
            })
        })
        .await;
        assert!(c2.events().is_empty());
        assert!(h.coordinator.version_change_operation.is_some());
        assert!(h.coordinator.version_change_transaction.is_none());

        h.close(first).await;

        let OpenResult::UpgradeNeeded { transaction, .. } =
            c2.wait_for_open(RequestId(2)).await
        else {
            panic!("expected an upgrade after the last connection closed");
        };
        assert_eq!(h.coordinator.connections.open_count(), 1);

        h.commit(transaction.id).await.unwrap();
        assert_eq!(h.coordinator.database_info.as_ref().unwrap().version(), 2);
    }

    #[tokio::test]
    async fn version_change_abort_restores_the_original_schema() {
        let mut h = harness(DatabaseInfo::new(0));
        let client = TestClient::new();
        h.open(&client, 1, 2).await;
        let OpenResult::UpgradeNeeded { transaction, .. } =
            client.wait_for_open(RequestId(1)).await
        else {
            panic!("expected an upgrade");
        };

        // The cache speculatively holds the new version while the upgrade
        // runs.
        assert_eq!(h.coordinator.database_info.as_ref().unwrap().version(), 2);

        let store = h
            .coordinator
            .database_info
            .as_mut()
            .unwrap()
            .create_new_object_store("s", None, false);
        let (reply, mut receiver) = oneshot::channel();
        h.coordinator
            .handle_command(CoordinatorCommand::CreateObjectStore {
                transaction: transaction.id,
                info: store,
                reply,
            })
            .await;
        h.settle().await;
        assert_eq!(receiver.try_recv().unwrap(), Ok(()));

        h.abort(transaction.id).await.unwrap();

        let info = h.coordinator.database_info.as_ref().unwrap();
        assert_eq!(info.version(), 0);
        assert!(!info.has_object_store_named("s"));
        assert!(h.coordinator.version_change_transaction.is_none());
        assert!(h.coordinator.in_progress_transactions.is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "reported complete twice")]
    async fn duplicate_commit_replies_are_a_programming_error() {
        let (info, ids) = schema_with_stores(1, &["a"]);
        let mut h = harness(info);
        let client = TestClient::new();
        let connection = h.open_success(&client, 1, 1).await;
        let t1 = h
            .create_transaction(connection, TransactionMode::ReadWrite, vec![ids[0]])
            .await;
        h.commit(t1.id).await.unwrap();

        // A second commit reply for the same transaction asserts; there is no
        // silent dedup.
        h.coordinator
            .handle_storage_reply(StorageReply::DidCommitTransaction {
                callback: 9999,
                transaction: t1.id,
                result: Ok(()),
            })
            .await;
    }

    #[tokio::test]
    async fn operations_on_queued_transactions_are_refused() {
        let (info, ids) = schema_with_stores(1, &["a"]);
        let a = ids[0];
        let mut h = harness(info);
        let client = TestClient::new();
        let connection = h.open_success(&client, 1, 1).await;

        let t1 = h
            .create_transaction(connection, TransactionMode::ReadWrite, vec![a])
            .await;
        let t2 = h
            .create_transaction(connection, TransactionMode::ReadWrite, vec![a])
            .await;
        assert!(h.coordinator.pending_transactions.contains(&t2.id));

        // t2 is still queued; an operation against it fails without reaching
        // storage.
        let (reply, mut receiver) = oneshot::channel();
        h.coordinator
            .handle_command(CoordinatorCommand::GetCount {
                transaction: t2.id,
                object_store: a,
                index: None,
                range: KeyRange::all(),
                reply,
            })
            .await;
        let error = receiver.try_recv().unwrap().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidStateError);

        // So does a schema change outside a version change transaction.
        let (reply, mut receiver) = oneshot::channel();
        h.coordinator
            .handle_command(CoordinatorCommand::DeleteObjectStore {
                transaction: t1.id,
                name: "a".to_string(),
                reply,
            })
            .await;
        let error = receiver.try_recv().unwrap().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidStateError);

        h.commit(t1.id).await.unwrap();
        h.commit(t2.id).await.unwrap();
    }

    #[tokio::test]
    async fn randomized_admission_preserves_invariants() {
        for seed in 0..10u8 {
            let mut rng = StdRng::from_seed([seed; 32]);
            let (info, ids) = schema_with_stores(1, &["a", "b", "c", "d"]);
            let mut h = harness(info);
            let client = TestClient::new();
            let connection = h.open_success(&client, 1, 1).await;

            let mut live = Vec::new();
            for _ in 0..12 {
                let mode = if rng.gen_bool(0.5) {
                    TransactionMode::ReadWrite
                } else {
                    TransactionMode::ReadOnly
                };
                let scope: Vec<_> = ids.iter().copied().filter(|_| rng.gen_bool(0.5)).collect();
                let scope = if scope.is_empty() { vec![ids[0]] } else { scope };
                let tx = h.create_transaction(connection, mode, scope).await;
                live.push(tx.id);
            }

            // Finish in random order; settle re-checks the invariants after
            // every reply.
            while !live.is_empty() {
                let active: Vec<_> = live
                    .iter()
                    .copied()
                    .filter(|id| h.coordinator.in_progress_transactions.contains(id))
                    .collect();
                assert!(!active.is_empty(), "seed {seed}: scheduler stalled");
                let victim = active[rng.gen_range(0..active.len())];
                h.commit(victim).await.unwrap();
                live.retain(|id| *id != victim);
            }
            assert!(h.coordinator.transactions.is_empty());
            assert!(h.coordinator.scope_counters.is_empty());
        }
    }
}
