// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use prometheus::Registry;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::backing_store::BackingStoreFactory;
use crate::connection::{ClientConnection, ConnectionId, OpenRequest};
use crate::context::{Context, DatabaseIdentifier, Parameters};
use crate::coordinator::{Coordinator, CoordinatorCommand, StateSnapshot};
use crate::error::{IdbError, IdbResult};
use crate::metrics::initialise_metrics;
use crate::record::{GetResult, IndexRecordType, KeyData, KeyRange, OverwriteMode};
use crate::schema::{IndexId, IndexInfo, ObjectStoreId, ObjectStoreInfo};
use crate::storage_thread::{self, StorageThreadHandle};
use crate::transaction::{TransactionId, TransactionInfo, TransactionMode};

/// Handle to one running database server: the coordinator task plus its
/// storage thread. Methods hand typed commands to the coordinator and await
/// the matching continuation, so callers never touch coordinator state
/// directly.
pub struct Database {
    context: Arc<Context>,
    commands: mpsc::UnboundedSender<CoordinatorCommand>,
    coordinator_handle: tokio::task::JoinHandle<()>,
    storage_handle: StorageThreadHandle,
}

impl Database {
    /// Starts the coordinator task and the storage thread for one database.
    /// The backing store itself is constructed lazily, on the storage thread,
    /// when the first open request arrives.
    pub fn start(
        identifier: DatabaseIdentifier,
        parameters: Parameters,
        store_factory: BackingStoreFactory,
        registry: Registry,
    ) -> Self {
        let metrics = initialise_metrics(registry);
        let context = Arc::new(Context::new(identifier, parameters, metrics));
        info!(
            database = %context.identifier,
            path = ?context.parameters.db_path,
            "starting database server"
        );

        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (reply_sender, reply_receiver) = mpsc::unbounded_channel();
        let (storage_sender, storage_handle) = storage_thread::start(store_factory, reply_sender);

        let coordinator = Coordinator::new(
            context.clone(),
            command_receiver,
            command_sender.downgrade(),
            reply_receiver,
            storage_sender,
        );
        let coordinator_handle = tokio::spawn(coordinator.run());

        Self {
            context,
            commands: command_sender,
            coordinator_handle,
            storage_handle,
        }
    }

    /// Stops the coordinator and joins the storage thread. Outstanding
    /// continuations resolve with a shutdown error.
    pub async fn stop(self) {
        info!(database = %self.context.identifier, "stopping database server");
        let Database {
            commands,
            coordinator_handle,
            storage_handle,
            ..
        } = self;
        drop(commands);
        coordinator_handle.await.ok();
        storage_handle.stop();
    }

    /// Requests a connection to this database. The outcome arrives through
    /// `client.did_open_database`: success, upgrade-needed, or an error.
    pub fn open_database(
        &self,
        client: Arc<dyn ClientConnection>,
        request: OpenRequest,
    ) -> IdbResult<()> {
        self.send(CoordinatorCommand::OpenDatabase { client, request })
    }

    pub fn close_connection(&self, connection: ConnectionId) -> IdbResult<()> {
        self.send(CoordinatorCommand::CloseConnection { connection })
    }

    /// Enqueues a read-only or read-write transaction. The returned info
    /// carries the transaction id; operations may be issued once the client
    /// observes `did_start_transaction`.
    pub async fn create_transaction(
        &self,
        connection: ConnectionId,
        mode: TransactionMode,
        scope: Vec<ObjectStoreId>,
    ) -> IdbResult<TransactionInfo> {
        self.call(|reply| CoordinatorCommand::CreateTransaction {
            connection,
            mode,
            scope,
            reply,
        })
        .await
    }

    pub async fn create_object_store(
        &self,
        transaction: TransactionId,
        info: ObjectStoreInfo,
    ) -> IdbResult<()> {
        self.call(|reply| CoordinatorCommand::CreateObjectStore {
            transaction,
            info,
            reply,
        })
        .await
    }

    pub async fn delete_object_store(
        &self,
        transaction: TransactionId,
        name: impl Into<String>,
    ) -> IdbResult<()> {
        let name = name.into();
        self.call(|reply| CoordinatorCommand::DeleteObjectStore {
            transaction,
            name,
            reply,
        })
        .await
    }

    pub async fn clear_object_store(
        &self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
    ) -> IdbResult<()> {
        self.call(|reply| CoordinatorCommand::ClearObjectStore {
            transaction,
            object_store,
            reply,
        })
        .await
    }

    pub async fn create_index(
        &self,
        transaction: TransactionId,
        info: IndexInfo,
    ) -> IdbResult<()> {
        self.call(|reply| CoordinatorCommand::CreateIndex {
            transaction,
            info,
            reply,
        })
        .await
    }

    /// Writes a record, returning the key actually used. With an invalid key
    /// on an auto-increment store the next generated number is used; in
    /// `NoOverwrite` mode an existing key fails with a `ConstraintError`.
    pub async fn put_or_add(
        &self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        key: KeyData,
        value: Bytes,
        mode: OverwriteMode,
    ) -> IdbResult<KeyData> {
        self.call(|reply| CoordinatorCommand::PutOrAdd {
            transaction,
            object_store,
            key,
            value,
            mode,
            reply,
        })
        .await
    }

    pub async fn get_record(
        &self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        index: Option<(IndexId, IndexRecordType)>,
        range: KeyRange,
    ) -> IdbResult<GetResult> {
        self.call(|reply| CoordinatorCommand::GetRecord {
            transaction,
            object_store,
            index,
            range,
            reply,
        })
        .await
    }

    pub async fn get_count(
        &self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        index: Option<IndexId>,
        range: KeyRange,
    ) -> IdbResult<u64> {
        self.call(|reply| CoordinatorCommand::GetCount {
            transaction,
            object_store,
            index,
            range,
            reply,
        })
        .await
    }

    pub async fn delete_record(
        &self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        range: KeyRange,
    ) -> IdbResult<()> {
        self.call(|reply| CoordinatorCommand::DeleteRecord {
            transaction,
            object_store,
            range,
            reply,
        })
        .await
    }

    pub async fn commit_transaction(&self, transaction: TransactionId) -> IdbResult<()> {
        self.call(|reply| CoordinatorCommand::CommitTransaction { transaction, reply })
            .await
    }

    pub async fn abort_transaction(&self, transaction: TransactionId) -> IdbResult<()> {
        self.call(|reply| CoordinatorCommand::AbortTransaction { transaction, reply })
            .await
    }

    /// Snapshot of the coordinator's state, processed in command order so it
    /// also acts as a barrier behind previously issued commands.
    pub async fn inspect(&self) -> IdbResult<StateSnapshot> {
        let (reply, receiver) = oneshot::channel();
        self.send(CoordinatorCommand::Inspect { reply })?;
        receiver.await.map_err(|_| IdbError::shutdown())
    }

    fn send(&self, command: CoordinatorCommand) -> IdbResult<()> {
        self.commands.send(command).map_err(|_| IdbError::shutdown())
    }

    async fn call<T>(
        &self,
        make_command: impl FnOnce(oneshot::Sender<IdbResult<T>>) -> CoordinatorCommand,
    ) -> IdbResult<T> {
        let (reply, receiver) = oneshot::channel();
        self.send(make_command(reply))?;
        receiver.await.map_err(|_| IdbError::shutdown())?
    }
}
