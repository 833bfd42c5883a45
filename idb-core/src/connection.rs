// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{IdbError, IdbResult};
use crate::schema::{DatabaseInfo, DatabaseVersion};
use crate::transaction::{TransactionId, TransactionInfo};

/// Identifier of one client session bound to this database.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// Client-chosen correlation id for an open request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// An `open` call as it arrives from the wire layer. A requested version of
/// `0` means "use the current version".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub request: RequestId,
    pub requested_version: DatabaseVersion,
}

/// Outcome of an open request, delivered through
/// [`ClientConnection::did_open_database`]. The success arm carries a snapshot
/// of the schema as installed at open time.
#[derive(Clone, Debug, PartialEq)]
pub enum OpenResult {
    Success {
        connection: ConnectionId,
        info: DatabaseInfo,
    },
    UpgradeNeeded {
        connection: ConnectionId,
        transaction: TransactionInfo,
    },
    Error(IdbError),
}

/// The channel back to one client. Implemented by the wire layer; every call
/// originates on the main context.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    async fn did_open_database(&self, request: RequestId, result: OpenResult);

    /// A newer version was requested by another client; this connection
    /// should close so the upgrade can proceed.
    async fn fire_version_change_event(
        &self,
        connection: ConnectionId,
        requested_version: DatabaseVersion,
    );

    /// The transaction was activated in the backing store and may now issue
    /// operations.
    async fn did_start_transaction(&self, transaction: TransactionId, result: IdbResult<()>);
}

/// One client session while the coordinator tracks it: the set of open,
/// not-yet-finished transactions and the close-pending flag.
pub(crate) struct DatabaseConnection {
    id: ConnectionId,
    client: Arc<dyn ClientConnection>,
    transactions: HashSet<TransactionId>,
    close_pending: bool,
}

impl DatabaseConnection {
    pub(crate) fn new(id: ConnectionId, client: Arc<dyn ClientConnection>) -> Self {
        Self {
            id,
            client,
            transactions: HashSet::new(),
            close_pending: false,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn client(&self) -> Arc<dyn ClientConnection> {
        self.client.clone()
    }

    pub(crate) fn add_transaction(&mut self, transaction: TransactionId) {
        let inserted = self.transactions.insert(transaction);
        debug_assert!(inserted);
    }

    pub(crate) fn remove_transaction(&mut self, transaction: TransactionId) {
        self.transactions.remove(&transaction);
    }

    pub(crate) fn has_unfinished_transactions(&self) -> bool {
        !self.transactions.is_empty()
    }

    pub(crate) fn unfinished_transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub(crate) fn close_pending(&self) -> bool {
        self.close_pending
    }

    pub(crate) fn set_close_pending(&mut self) {
        self.close_pending = true;
    }
}

/// Tracks live connections: the open set, and the close-pending set holding
/// connections whose client has gone away while transactions were still
/// outstanding. A connection is dropped once it is in neither.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    open: HashMap<ConnectionId, DatabaseConnection>,
    close_pending: HashMap<ConnectionId, DatabaseConnection>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_open(&mut self, connection: DatabaseConnection) {
        debug_assert!(!self.open.contains_key(&connection.id()));
        self.open.insert(connection.id(), connection);
    }

    pub(crate) fn take_open(&mut self, id: ConnectionId) -> Option<DatabaseConnection> {
        self.open.remove(&id)
    }

    pub(crate) fn has_any_open(&self) -> bool {
        !self.open.is_empty()
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open.len()
    }

    pub(crate) fn close_pending_count(&self) -> usize {
        self.close_pending.len()
    }

    pub(crate) fn iter_open(&self) -> impl Iterator<Item = &DatabaseConnection> {
        self.open.values()
    }

    pub(crate) fn open_mut(&mut self, id: ConnectionId) -> Option<&mut DatabaseConnection> {
        self.open.get_mut(&id)
    }

    pub(crate) fn add_close_pending(&mut self, connection: DatabaseConnection) {
        debug_assert!(connection.close_pending());
        self.close_pending.insert(connection.id(), connection);
    }

    /// Looks a connection up in either set.
    pub(crate) fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut DatabaseConnection> {
        match self.open.get_mut(&id) {
            Some(connection) => Some(connection),
            None => self.close_pending.get_mut(&id),
        }
    }

    /// Drops a close-pending connection once its last transaction finished.
    /// Returns true when the connection was released.
    pub(crate) fn release_if_finished(&mut self, id: ConnectionId) -> bool {
        let finished = self
            .close_pending
            .get(&id)
            .is_some_and(|connection| !connection.has_unfinished_transactions());
        if finished {
            self.close_pending.remove(&id);
        }
        finished
    }
}
