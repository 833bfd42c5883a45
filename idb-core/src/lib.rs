// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-database transaction coordinator of an embeddable object-oriented
//! database server modeled on the IndexedDB data model. One [`Database`]
//! instance owns a single logical database: it admits client connections,
//! mediates version changes, schedules read and read-write transactions
//! against the single-writer-per-scope rule, and dispatches every storage
//! operation to a dedicated storage thread.

mod backing_store;
mod callback_table;
mod connection;
mod context;
mod coordinator;
mod error;
mod memory_store;
mod metrics;
mod record;
mod schema;
mod scope;
mod server;
mod storage_thread;
mod transaction;

pub use backing_store::{BackingStore, BackingStoreFactory};
pub use connection::{ClientConnection, ConnectionId, OpenRequest, OpenResult, RequestId};
pub use context::{DatabaseIdentifier, Parameters};
pub use coordinator::{StateSnapshot, TransactionSnapshot};
pub use error::{ErrorKind, IdbError, IdbResult};
pub use memory_store::MemoryBackingStore;
pub use record::{GetResult, IndexRecordType, KeyData, KeyRange, OverwriteMode};
pub use schema::{
    DatabaseInfo, DatabaseVersion, IndexId, IndexInfo, ObjectStoreId, ObjectStoreInfo,
};
pub use server::Database;
pub use transaction::{TransactionId, TransactionInfo, TransactionMode, TransactionState};
