// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;

use crate::error::IdbResult;
use crate::record::{GetResult, IndexRecordType, KeyData, KeyRange};
use crate::schema::{DatabaseInfo, IndexId, IndexInfo, ObjectStoreId, ObjectStoreInfo};
use crate::transaction::{TransactionId, TransactionInfo};

/// Constructs the backing store, on the storage thread, when the database is
/// first opened.
pub type BackingStoreFactory = Box<dyn FnOnce() -> Box<dyn BackingStore> + Send>;

/// The persistent-data component. Thread-confined: every method runs on the
/// storage thread and may block on I/O. The coordinator never calls it
/// directly; it posts tasks to the storage worker which owns the store.
///
/// Each method returns exactly one error value, carried back through the
/// reply to its typed callback.
#[cfg_attr(test, mockall::automock)]
pub trait BackingStore: Send {
    /// Reads the schema from disk, establishing an empty version-0 database
    /// if none exists yet.
    fn get_or_establish_info(&mut self) -> IdbResult<DatabaseInfo>;

    fn begin_transaction(&mut self, info: &TransactionInfo) -> IdbResult<()>;

    fn commit_transaction(&mut self, transaction: TransactionId) -> IdbResult<()>;

    fn abort_transaction(&mut self, transaction: TransactionId) -> IdbResult<()>;

    fn create_object_store(
        &mut self,
        transaction: TransactionId,
        info: &ObjectStoreInfo,
    ) -> IdbResult<()>;

    fn delete_object_store(&mut self, transaction: TransactionId, name: &str) -> IdbResult<()>;

    fn clear_object_store(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
    ) -> IdbResult<()>;

    fn create_index(&mut self, transaction: TransactionId, info: &IndexInfo) -> IdbResult<()>;

    /// Allocates the next auto-increment key number for the store.
    fn generate_key_number(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
    ) -> IdbResult<u64>;

    fn key_exists_in_object_store(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        key: &KeyData,
    ) -> IdbResult<bool>;

    fn put_record(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        key: &KeyData,
        value: &Bytes,
    ) -> IdbResult<()>;

    fn delete_range(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        range: &KeyRange,
    ) -> IdbResult<()>;

    /// Returns the value of the lowest-keyed record in the range, or `None`
    /// when nothing matches.
    fn get_record(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        range: &KeyRange,
    ) -> IdbResult<Option<Bytes>>;

    fn get_index_record(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        index: IndexId,
        record_type: IndexRecordType,
        range: &KeyRange,
    ) -> IdbResult<GetResult>;

    fn get_count(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        index: Option<IndexId>,
        range: &KeyRange,
    ) -> IdbResult<u64>;
}
