// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::thread;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backing_store::{BackingStore, BackingStoreFactory};
use crate::callback_table::CallbackId;
use crate::error::{ErrorKind, IdbError, IdbResult};
use crate::record::{GetResult, IndexRecordType, KeyData, KeyRange, OverwriteMode};
use crate::schema::{DatabaseInfo, IndexId, IndexInfo, ObjectStoreId, ObjectStoreInfo};
use crate::transaction::{TransactionId, TransactionInfo, TransactionMode};

/// A unit of work posted from the main context to the storage thread. Tasks
/// are self-contained: each owns copies of its arguments. FIFO per direction.
pub(crate) enum StorageTask {
    OpenBackingStore,
    BeginTransaction {
        info: TransactionInfo,
    },
    CreateObjectStore {
        callback: CallbackId,
        transaction: TransactionId,
        info: ObjectStoreInfo,
    },
    DeleteObjectStore {
        callback: CallbackId,
        transaction: TransactionId,
        name: String,
    },
    ClearObjectStore {
        callback: CallbackId,
        transaction: TransactionId,
        object_store: ObjectStoreId,
    },
    CreateIndex {
        callback: CallbackId,
        transaction: TransactionId,
        info: IndexInfo,
    },
    PutOrAdd {
        callback: CallbackId,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        key: KeyData,
        value: Bytes,
        mode: OverwriteMode,
    },
    GetRecord {
        callback: CallbackId,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        index: Option<(IndexId, IndexRecordType)>,
        range: KeyRange,
    },
    GetCount {
        callback: CallbackId,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        index: Option<IndexId>,
        range: KeyRange,
    },
    DeleteRecord {
        callback: CallbackId,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        range: KeyRange,
    },
    CommitTransaction {
        callback: CallbackId,
        transaction: TransactionId,
    },
    AbortTransaction {
        callback: CallbackId,
        transaction: TransactionId,
    },
}

/// A reply posted from the storage thread back to the main context, observed
/// only after its task completed on the storage worker.
pub(crate) enum StorageReply {
    DidOpenBackingStore {
        result: IdbResult<DatabaseInfo>,
    },
    DidBeginTransaction {
        transaction: TransactionId,
        result: IdbResult<()>,
    },
    DidCreateObjectStore {
        callback: CallbackId,
        result: IdbResult<()>,
        info: ObjectStoreInfo,
    },
    DidDeleteObjectStore {
        callback: CallbackId,
        result: IdbResult<()>,
        name: String,
    },
    DidClearObjectStore {
        callback: CallbackId,
        result: IdbResult<()>,
    },
    DidCreateIndex {
        callback: CallbackId,
        result: IdbResult<()>,
        info: IndexInfo,
    },
    DidPutOrAdd {
        callback: CallbackId,
        result: IdbResult<KeyData>,
    },
    DidGetRecord {
        callback: CallbackId,
        result: IdbResult<GetResult>,
    },
    DidGetCount {
        callback: CallbackId,
        result: IdbResult<u64>,
    },
    DidDeleteRecord {
        callback: CallbackId,
        result: IdbResult<()>,
    },
    DidCommitTransaction {
        callback: CallbackId,
        transaction: TransactionId,
        result: IdbResult<()>,
    },
    DidAbortTransaction {
        callback: CallbackId,
        transaction: TransactionId,
        result: IdbResult<()>,
    },
}

/// Handle keeping the storage thread alive. Dropping the strong task sender
/// via [`StorageThreadHandle::stop`] lets the worker drain its queue and exit.
pub(crate) struct StorageThreadHandle {
    sender: mpsc::UnboundedSender<StorageTask>,
    join_handle: thread::JoinHandle<()>,
}

impl StorageThreadHandle {
    pub(crate) fn stop(self) {
        // Dropping the sender invalidates the weak senders held elsewhere.
        drop(self.sender);
        self.join_handle.join().ok();
    }
}

/// Spawns the storage thread. The coordinator posts through the returned weak
/// sender; the strong sender lives in the handle so that dropping the handle
/// shuts the worker down.
pub(crate) fn start(
    factory: BackingStoreFactory,
    replies: mpsc::UnboundedSender<StorageReply>,
) -> (mpsc::WeakUnboundedSender<StorageTask>, StorageThreadHandle) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let worker = StorageWorker {
        factory: Some(factory),
        store: None,
        database_info: None,
        version_change_snapshot: None,
        receiver,
        replies,
    };
    let join_handle = thread::Builder::new()
        .name("idb-storage".to_string())
        .spawn(move || worker.run())
        .unwrap();
    let weak_sender = sender.downgrade();
    let handle = StorageThreadHandle {
        sender,
        join_handle,
    };
    (weak_sender, handle)
}

/// The storage context: exclusively owns the backing store, runs each task to
/// completion before dequeueing the next, and may block freely on I/O.
///
/// The worker keeps its own copy of the schema, established at open and
/// updated by the schema mutations it performs, so operations like
/// `put_or_add` can resolve store metadata without reaching into
/// main-context state.
struct StorageWorker {
    factory: Option<BackingStoreFactory>,
    store: Option<Box<dyn BackingStore>>,
    database_info: Option<DatabaseInfo>,
    /// Schema snapshot taken when a version change begins, restored if that
    /// transaction aborts.
    version_change_snapshot: Option<(TransactionId, DatabaseInfo)>,
    receiver: mpsc::UnboundedReceiver<StorageTask>,
    replies: mpsc::UnboundedSender<StorageReply>,
}

impl StorageWorker {
    fn run(mut self) {
        info!("storage thread started");
        while let Some(task) = self.receiver.blocking_recv() {
            self.process(task);
        }
        info!("storage thread stopped");
    }

    fn process(&mut self, task: StorageTask) {
        match task {
            StorageTask::OpenBackingStore => self.perform_open_backing_store(),
            StorageTask::BeginTransaction { info } => self.perform_begin_transaction(info),
            StorageTask::CreateObjectStore {
                callback,
                transaction,
                info,
            } => self.perform_create_object_store(callback, transaction, info),
            StorageTask::DeleteObjectStore {
                callback,
                transaction,
                name,
            } => self.perform_delete_object_store(callback, transaction, name),
            StorageTask::ClearObjectStore {
                callback,
                transaction,
                object_store,
            } => {
                let result = self.store().clear_object_store(transaction, object_store);
                self.reply(StorageReply::DidClearObjectStore { callback, result });
            }
            StorageTask::CreateIndex {
                callback,
                transaction,
                info,
            } => self.perform_create_index(callback, transaction, info),
            StorageTask::PutOrAdd {
                callback,
                transaction,
                object_store,
                key,
                value,
                mode,
            } => {
                let result = self.put_or_add(transaction, object_store, key, value, mode);
                self.reply(StorageReply::DidPutOrAdd { callback, result });
            }
            StorageTask::GetRecord {
                callback,
                transaction,
                object_store,
                index,
                range,
            } => {
                let result = match index {
                    Some((index, record_type)) => self.store().get_index_record(
                        transaction,
                        object_store,
                        index,
                        record_type,
                        &range,
                    ),
                    None => self
                        .store()
                        .get_record(transaction, object_store, &range)
                        .map(|value| GetResult { key: None, value }),
                };
                self.reply(StorageReply::DidGetRecord { callback, result });
            }
            StorageTask::GetCount {
                callback,
                transaction,
                object_store,
                index,
                range,
            } => {
                let result = self
                    .store()
                    .get_count(transaction, object_store, index, &range);
                self.reply(StorageReply::DidGetCount { callback, result });
            }
            StorageTask::DeleteRecord {
                callback,
                transaction,
                object_store,
                range,
            } => {
                let result = self.store().delete_range(transaction, object_store, &range);
                self.reply(StorageReply::DidDeleteRecord { callback, result });
            }
            StorageTask::CommitTransaction {
                callback,
                transaction,
            } => self.perform_commit_transaction(callback, transaction),
            StorageTask::AbortTransaction {
                callback,
                transaction,
            } => self.perform_abort_transaction(callback, transaction),
        }
    }

    fn store(&mut self) -> &mut dyn BackingStore {
        self.store
            .as_mut()
            .expect("backing store task before open")
            .as_mut()
    }

    fn reply(&self, reply: StorageReply) {
        if self.replies.send(reply).is_err() {
            warn!("coordinator went away, dropping storage reply");
        }
    }

    fn perform_open_backing_store(&mut self) {
        debug!("opening backing store");
        let factory = self.factory.take().expect("backing store opened twice");
        self.store = Some(factory());
        let result = self.store().get_or_establish_info();
        if let Ok(info) = &result {
            self.database_info = Some(info.clone());
        }
        self.reply(StorageReply::DidOpenBackingStore { result });
    }

    fn perform_begin_transaction(&mut self, info: TransactionInfo) {
        debug!(transaction = %info.id, "beginning transaction in backing store");
        if info.mode == TransactionMode::VersionChange {
            let cached = self
                .database_info
                .as_mut()
                .expect("version change before open");
            self.version_change_snapshot = Some((info.id, cached.clone()));
            if let Some(new_version) = info.new_version {
                cached.set_version(new_version);
            }
        }
        let result = self.store().begin_transaction(&info);
        self.reply(StorageReply::DidBeginTransaction {
            transaction: info.id,
            result,
        });
    }

    fn perform_create_object_store(
        &mut self,
        callback: CallbackId,
        transaction: TransactionId,
        info: ObjectStoreInfo,
    ) {
        let result = self.store().create_object_store(transaction, &info);
        if result.is_ok() {
            self.database_info
                .as_mut()
                .expect("schema op before open")
                .add_existing_object_store(info.clone());
        }
        self.reply(StorageReply::DidCreateObjectStore {
            callback,
            result,
            info,
        });
    }

    fn perform_delete_object_store(
        &mut self,
        callback: CallbackId,
        transaction: TransactionId,
        name: String,
    ) {
        let result = self.store().delete_object_store(transaction, &name);
        if result.is_ok() {
            self.database_info
                .as_mut()
                .expect("schema op before open")
                .delete_object_store(&name);
        }
        self.reply(StorageReply::DidDeleteObjectStore {
            callback,
            result,
            name,
        });
    }

    fn perform_create_index(
        &mut self,
        callback: CallbackId,
        transaction: TransactionId,
        info: IndexInfo,
    ) {
        let result = self.store().create_index(transaction, &info);
        if result.is_ok() {
            self.database_info
                .as_mut()
                .expect("schema op before open")
                .object_store_mut(info.object_store)
                .expect("object store of the new index exists")
                .add_existing_index(info.clone());
        }
        self.reply(StorageReply::DidCreateIndex {
            callback,
            result,
            info,
        });
    }

    /// The object store storage operation: resolve the store, pick the
    /// effective key, enforce `add` semantics, then delete-then-insert so
    /// indexes observe the replacement as a delete followed by an insert.
    fn put_or_add(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        key: KeyData,
        value: Bytes,
        mode: OverwriteMode,
    ) -> IdbResult<KeyData> {
        let info = self
            .database_info
            .as_ref()
            .and_then(|db| db.object_store(object_store))
            .cloned()
            .ok_or_else(|| {
                IdbError::with_message(
                    ErrorKind::InvalidStateError,
                    "object store cannot be found in the backing store",
                )
            })?;
        let store = self.store();

        let used_key = if info.auto_increment && !key.is_valid() {
            let number = store.generate_key_number(transaction, object_store)?;
            KeyData::Number(number as i64)
        } else {
            key
        };

        if mode == OverwriteMode::NoOverwrite
            && store.key_exists_in_object_store(transaction, object_store, &used_key)?
        {
            return Err(IdbError::with_message(
                ErrorKind::ConstraintError,
                "key already exists in the object store",
            ));
        }

        store.delete_range(transaction, object_store, &KeyRange::only(used_key.clone()))?;
        store.put_record(transaction, object_store, &used_key, &value)?;
        Ok(used_key)
    }

    fn perform_commit_transaction(&mut self, callback: CallbackId, transaction: TransactionId) {
        debug!(transaction = %transaction, "committing transaction in backing store");
        let result = self.store().commit_transaction(transaction);
        if self
            .version_change_snapshot
            .as_ref()
            .is_some_and(|(id, _)| *id == transaction)
        {
            self.version_change_snapshot = None;
        }
        self.reply(StorageReply::DidCommitTransaction {
            callback,
            transaction,
            result,
        });
    }

    fn perform_abort_transaction(&mut self, callback: CallbackId, transaction: TransactionId) {
        debug!(transaction = %transaction, "aborting transaction in backing store");
        let result = self.store().abort_transaction(transaction);
        if self
            .version_change_snapshot
            .as_ref()
            .is_some_and(|(id, _)| *id == transaction)
        {
            let (_, original) = self.version_change_snapshot.take().unwrap();
            self.database_info = Some(original);
        }
        self.reply(StorageReply::DidAbortTransaction {
            callback,
            transaction,
            result,
        });
    }
}
