// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Installed schema version of a database. Version `0` means the database has
/// just been created and no version-change transaction has committed yet.
pub type DatabaseVersion = u64;

/// Identifier of an object store, unique within its database.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjectStoreId(pub u64);

impl fmt::Display for ObjectStoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "os{}", self.0)
    }
}

/// Identifier of an index, unique within its object store.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct IndexId(pub u64);

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "idx{}", self.0)
    }
}

/// Schema of one index: a key path evaluated against record values, with an
/// optional uniqueness constraint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id: IndexId,
    pub name: String,
    pub object_store: ObjectStoreId,
    pub key_path: String,
    pub unique: bool,
}

impl IndexInfo {
    pub fn new(
        id: IndexId,
        name: impl Into<String>,
        object_store: ObjectStoreId,
        key_path: impl Into<String>,
        unique: bool,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            object_store,
            key_path: key_path.into(),
            unique,
        }
    }
}

/// Schema of one object store, including its indexes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreInfo {
    pub id: ObjectStoreId,
    pub name: String,
    pub key_path: Option<String>,
    pub auto_increment: bool,
    indexes: HashMap<IndexId, IndexInfo>,
}

impl ObjectStoreInfo {
    pub fn new(
        id: ObjectStoreId,
        name: impl Into<String>,
        key_path: Option<String>,
        auto_increment: bool,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            key_path,
            auto_increment,
            indexes: HashMap::new(),
        }
    }

    /// Allocates the next index id and returns the info for a new index on
    /// this store. The index is not added until the backing store confirms it.
    pub fn create_new_index(
        &self,
        name: impl Into<String>,
        key_path: impl Into<String>,
        unique: bool,
    ) -> IndexInfo {
        let next = IndexId(self.indexes.keys().map(|id| id.0).max().unwrap_or(0) + 1);
        IndexInfo::new(next, name, self.id, key_path, unique)
    }

    /// Adds an index that the backing store reports as existing.
    /// Index names and ids are unique per store.
    pub fn add_existing_index(&mut self, info: IndexInfo) {
        assert_eq!(info.object_store, self.id);
        assert!(
            !self.has_index_named(&info.name),
            "duplicate index name {}",
            info.name
        );
        let previous = self.indexes.insert(info.id, info);
        assert!(previous.is_none(), "duplicate index id");
    }

    pub fn has_index_named(&self, name: &str) -> bool {
        self.indexes.values().any(|index| index.name == name)
    }

    pub fn index(&self, id: IndexId) -> Option<&IndexInfo> {
        self.indexes.get(&id)
    }

    pub fn remove_index(&mut self, id: IndexId) -> Option<IndexInfo> {
        self.indexes.remove(&id)
    }

    pub fn indexes(&self) -> impl Iterator<Item = &IndexInfo> {
        self.indexes.values()
    }
}

/// Cached schema of a database: its version and object stores. The main
/// context owns one of these, mutated only as a consequence of a successful
/// storage reply and replaced wholesale when a version change aborts. The
/// storage worker keeps its own copy alongside the backing store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    version: DatabaseVersion,
    object_stores: HashMap<ObjectStoreId, ObjectStoreInfo>,
    max_object_store_id: u64,
}

impl DatabaseInfo {
    pub fn new(version: DatabaseVersion) -> Self {
        Self {
            version,
            object_stores: HashMap::new(),
            max_object_store_id: 0,
        }
    }

    pub fn version(&self) -> DatabaseVersion {
        self.version
    }

    pub fn set_version(&mut self, version: DatabaseVersion) {
        self.version = version;
    }

    /// Allocates the next object store id and returns the info for a new
    /// store. The store is not added to the schema until the backing store
    /// confirms its creation.
    pub fn create_new_object_store(
        &mut self,
        name: impl Into<String>,
        key_path: Option<String>,
        auto_increment: bool,
    ) -> ObjectStoreInfo {
        self.max_object_store_id += 1;
        ObjectStoreInfo::new(
            ObjectStoreId(self.max_object_store_id),
            name,
            key_path,
            auto_increment,
        )
    }

    /// Adds a store that the backing store reports as existing.
    /// Store names and ids are unique within the database.
    pub fn add_existing_object_store(&mut self, info: ObjectStoreInfo) {
        assert!(
            !self.has_object_store_named(&info.name),
            "duplicate object store name {}",
            info.name
        );
        self.max_object_store_id = self.max_object_store_id.max(info.id.0);
        let previous = self.object_stores.insert(info.id, info);
        assert!(previous.is_none(), "duplicate object store id");
    }

    pub fn delete_object_store(&mut self, name: &str) -> Option<ObjectStoreInfo> {
        let id = self.object_store_id_for_name(name)?;
        self.object_stores.remove(&id)
    }

    pub fn object_store(&self, id: ObjectStoreId) -> Option<&ObjectStoreInfo> {
        self.object_stores.get(&id)
    }

    pub fn object_store_mut(&mut self, id: ObjectStoreId) -> Option<&mut ObjectStoreInfo> {
        self.object_stores.get_mut(&id)
    }

    pub fn object_store_named(&self, name: &str) -> Option<&ObjectStoreInfo> {
        self.object_stores.values().find(|info| info.name == name)
    }

    pub fn object_store_id_for_name(&self, name: &str) -> Option<ObjectStoreId> {
        self.object_store_named(name).map(|info| info.id)
    }

    pub fn has_object_store_named(&self, name: &str) -> bool {
        self.object_store_named(name).is_some()
    }

    pub fn object_store_ids(&self) -> Vec<ObjectStoreId> {
        let mut ids: Vec<_> = self.object_stores.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn object_stores(&self) -> impl Iterator<Item = &ObjectStoreInfo> {
        self.object_stores.values()
    }
}
