// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;
use crate::schema::{DatabaseInfo, DatabaseVersion, ObjectStoreId};

/// Identifier of a transaction, unique within the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    VersionChange,
}

/// Lifecycle of a transaction on the main context. `Pending` transactions sit
/// in the scheduling queue; `Activating` ones have a `begin` task in flight;
/// the terminal transitions run through `Committing` or `Aborting`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Pending,
    Activating,
    Active,
    Committing,
    Aborting,
    Completed,
}

/// The owned description of a transaction, shipped by value to the storage
/// thread and back to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub mode: TransactionMode,
    /// Object stores the transaction may touch. Empty for a version change,
    /// which implicitly covers every store.
    pub scope: Vec<ObjectStoreId>,
    /// The version the database moves to when this transaction commits.
    /// `Some` only for version changes.
    pub new_version: Option<DatabaseVersion>,
}

impl TransactionInfo {
    pub fn new(id: TransactionId, mode: TransactionMode, scope: Vec<ObjectStoreId>) -> Self {
        debug_assert!(mode != TransactionMode::VersionChange);
        Self {
            id,
            mode,
            scope,
            new_version: None,
        }
    }

    pub fn version_change(id: TransactionId, new_version: DatabaseVersion) -> Self {
        Self {
            id,
            mode: TransactionMode::VersionChange,
            scope: Vec::new(),
            new_version: Some(new_version),
        }
    }
}

/// Main-context record of one live transaction. Owned by the coordinator's
/// transaction arena; the owning connection and the scheduling containers
/// refer to it by id only.
pub(crate) struct Transaction {
    info: TransactionInfo,
    state: TransactionState,
    connection: ConnectionId,
    /// Snapshot of the schema taken when a version change starts, restored
    /// wholesale if the transaction aborts.
    original_database_info: Option<DatabaseInfo>,
}

impl Transaction {
    pub(crate) fn new(info: TransactionInfo, connection: ConnectionId) -> Self {
        Self {
            info,
            state: TransactionState::Pending,
            connection,
            original_database_info: None,
        }
    }

    pub(crate) fn version_change(
        info: TransactionInfo,
        connection: ConnectionId,
        original_database_info: DatabaseInfo,
    ) -> Self {
        debug_assert!(info.mode == TransactionMode::VersionChange);
        Self {
            info,
            state: TransactionState::Pending,
            connection,
            original_database_info: Some(original_database_info),
        }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.info.id
    }

    pub(crate) fn mode(&self) -> TransactionMode {
        self.info.mode
    }

    pub(crate) fn scope(&self) -> &[ObjectStoreId] {
        &self.info.scope
    }

    pub(crate) fn info(&self) -> &TransactionInfo {
        &self.info
    }

    pub(crate) fn state(&self) -> TransactionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    pub(crate) fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub(crate) fn original_database_info(&self) -> Option<&DatabaseInfo> {
        self.original_database_info.as_ref()
    }
}
