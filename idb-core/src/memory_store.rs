// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Bytes;

use crate::backing_store::BackingStore;
use crate::error::{ErrorKind, IdbError, IdbResult};
use crate::record::{GetResult, IndexRecordType, KeyData, KeyRange};
use crate::schema::{DatabaseInfo, DatabaseVersion, IndexId, IndexInfo, ObjectStoreId, ObjectStoreInfo};
use crate::transaction::{TransactionId, TransactionInfo, TransactionMode};

/// Index contents: index key to the set of primary keys it refers to.
type IndexEntries = BTreeMap<KeyData, BTreeSet<KeyData>>;

struct StoreState {
    info: ObjectStoreInfo,
    records: BTreeMap<KeyData, Bytes>,
    indexes: HashMap<IndexId, IndexEntries>,
    key_generator: u64,
}

impl StoreState {
    fn new(info: ObjectStoreInfo) -> Self {
        Self {
            info,
            records: BTreeMap::new(),
            indexes: HashMap::new(),
            key_generator: 0,
        }
    }

    /// Fails with a `ConstraintError` if writing `value` under `key` would
    /// give any unique index two primary keys for the same index key.
    fn check_unique_constraints(&self, key: &KeyData, value: &Bytes) -> IdbResult<()> {
        for index in self.info.indexes() {
            if !index.unique {
                continue;
            }
            let Some(index_key) = extract_index_key(value, &index.key_path) else {
                continue;
            };
            let occupied = self
                .indexes
                .get(&index.id)
                .and_then(|entries| entries.get(&index_key))
                .is_some_and(|primaries| !primaries.is_empty() && !primaries.contains(key));
            if occupied {
                return Err(IdbError::with_message(
                    ErrorKind::ConstraintError,
                    format!("unique index {} already has key", index.name),
                ));
            }
        }
        Ok(())
    }

    fn add_index_entries(&mut self, key: &KeyData, value: &Bytes) {
        for index in self.info.indexes() {
            if let Some(index_key) = extract_index_key(value, &index.key_path) {
                self.indexes
                    .entry(index.id)
                    .or_default()
                    .entry(index_key)
                    .or_default()
                    .insert(key.clone());
            }
        }
    }

    fn remove_index_entries(&mut self, key: &KeyData, value: &Bytes) {
        for index in self.info.indexes() {
            let Some(index_key) = extract_index_key(value, &index.key_path) else {
                continue;
            };
            if let Some(entries) = self.indexes.get_mut(&index.id) {
                if let Some(primaries) = entries.get_mut(&index_key) {
                    primaries.remove(key);
                    if primaries.is_empty() {
                        entries.remove(&index_key);
                    }
                }
            }
        }
    }
}

enum UndoOp {
    CreateObjectStore {
        id: ObjectStoreId,
    },
    DeleteObjectStore {
        state: StoreState,
    },
    ClearObjectStore {
        id: ObjectStoreId,
        records: BTreeMap<KeyData, Bytes>,
        indexes: HashMap<IndexId, IndexEntries>,
    },
    CreateIndex {
        store: ObjectStoreId,
        index: IndexId,
    },
    PutRecord {
        store: ObjectStoreId,
        key: KeyData,
        prior: Option<Bytes>,
    },
    DeleteRecord {
        store: ObjectStoreId,
        key: KeyData,
        value: Bytes,
    },
    BumpKeyGenerator {
        store: ObjectStoreId,
        prior: u64,
    },
    SetVersion {
        prior: DatabaseVersion,
    },
}

/// An in-memory [`BackingStore`]. Values are JSON documents; index key paths
/// are dot-separated field paths evaluated against them. Every mutation a
/// transaction performs is recorded in an undo log that an abort replays in
/// reverse, so schema and records roll back the same way a durable store
/// would roll them back.
///
/// The store relies on the coordinator's scheduling rules for isolation; it
/// does not arbitrate between concurrently active transactions itself.
#[derive(Default)]
pub struct MemoryBackingStore {
    version: DatabaseVersion,
    stores: HashMap<ObjectStoreId, StoreState>,
    live_transactions: HashMap<TransactionId, Vec<UndoOp>>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn store_mut(&mut self, id: ObjectStoreId) -> IdbResult<&mut StoreState> {
        self.stores.get_mut(&id).ok_or_else(|| {
            IdbError::with_message(ErrorKind::InvalidStateError, format!("no object store {id}"))
        })
    }

    fn ensure_transaction(&self, transaction: TransactionId) -> IdbResult<()> {
        if self.live_transactions.contains_key(&transaction) {
            Ok(())
        } else {
            Err(IdbError::with_message(
                ErrorKind::InvalidStateError,
                format!("unknown transaction {transaction}"),
            ))
        }
    }

    fn log(&mut self, transaction: TransactionId, op: UndoOp) {
        self.live_transactions
            .get_mut(&transaction)
            .expect("transaction was checked live")
            .push(op);
    }

    fn undo(&mut self, op: UndoOp) {
        match op {
            UndoOp::CreateObjectStore { id } => {
                self.stores.remove(&id);
            }
            UndoOp::DeleteObjectStore { state } => {
                self.stores.insert(state.info.id, state);
            }
            UndoOp::ClearObjectStore {
                id,
                records,
                indexes,
            } => {
                if let Some(store) = self.stores.get_mut(&id) {
                    store.records = records;
                    store.indexes = indexes;
                }
            }
            UndoOp::CreateIndex { store, index } => {
                if let Some(store) = self.stores.get_mut(&store) {
                    store.info.remove_index(index);
                    store.indexes.remove(&index);
                }
            }
            UndoOp::PutRecord { store, key, prior } => {
                if let Some(store) = self.stores.get_mut(&store) {
                    if let Some(current) = store.records.remove(&key) {
                        store.remove_index_entries(&key, &current);
                    }
                    if let Some(prior) = prior {
                        store.records.insert(key.clone(), prior.clone());
                        store.add_index_entries(&key, &prior);
                    }
                }
            }
            UndoOp::DeleteRecord { store, key, value } => {
                if let Some(store) = self.stores.get_mut(&store) {
                    store.records.insert(key.clone(), value.clone());
                    store.add_index_entries(&key, &value);
                }
            }
            UndoOp::BumpKeyGenerator { store, prior } => {
                if let Some(store) = self.stores.get_mut(&store) {
                    store.key_generator = prior;
                }
            }
            UndoOp::SetVersion { prior } => {
                self.version = prior;
            }
        }
    }
}

/// Evaluates a dot-separated key path against a JSON value, producing a key
/// when the path lands on a number or a string.
fn extract_index_key(value: &Bytes, key_path: &str) -> Option<KeyData> {
    let mut current: serde_json::Value = serde_json::from_slice(value).ok()?;
    for segment in key_path.split('.') {
        current = current.get_mut(segment)?.take();
    }
    match current {
        serde_json::Value::Number(number) => number.as_i64().map(KeyData::Number),
        serde_json::Value::String(string) => Some(KeyData::String(string)),
        _ => None,
    }
}

impl BackingStore for MemoryBackingStore {
    fn get_or_establish_info(&mut self) -> IdbResult<DatabaseInfo> {
        let mut info = DatabaseInfo::new(self.version);
        let mut stores: Vec<_> = self.stores.values().collect();
        stores.sort_by_key(|store| store.info.id);
        for store in stores {
            info.add_existing_object_store(store.info.clone());
        }
        Ok(info)
    }

    fn begin_transaction(&mut self, info: &TransactionInfo) -> IdbResult<()> {
        if self.live_transactions.contains_key(&info.id) {
            return Err(IdbError::with_message(
                ErrorKind::InvalidStateError,
                format!("transaction {} already begun", info.id),
            ));
        }
        self.live_transactions.insert(info.id, Vec::new());
        if info.mode == TransactionMode::VersionChange {
            if let Some(new_version) = info.new_version {
                self.log(info.id, UndoOp::SetVersion {
                    prior: self.version,
                });
                self.version = new_version;
            }
        }
        Ok(())
    }

    fn commit_transaction(&mut self, transaction: TransactionId) -> IdbResult<()> {
        self.ensure_transaction(transaction)?;
        self.live_transactions.remove(&transaction);
        Ok(())
    }

    fn abort_transaction(&mut self, transaction: TransactionId) -> IdbResult<()> {
        self.ensure_transaction(transaction)?;
        let log = self.live_transactions.remove(&transaction).unwrap();
        for op in log.into_iter().rev() {
            self.undo(op);
        }
        Ok(())
    }

    fn create_object_store(
        &mut self,
        transaction: TransactionId,
        info: &ObjectStoreInfo,
    ) -> IdbResult<()> {
        self.ensure_transaction(transaction)?;
        let duplicate = self.stores.contains_key(&info.id)
            || self.stores.values().any(|store| store.info.name == info.name);
        if duplicate {
            return Err(IdbError::with_message(
                ErrorKind::ConstraintError,
                format!("object store {} already exists", info.name),
            ));
        }
        self.stores.insert(info.id, StoreState::new(info.clone()));
        self.log(transaction, UndoOp::CreateObjectStore { id: info.id });
        Ok(())
    }

    fn delete_object_store(&mut self, transaction: TransactionId, name: &str) -> IdbResult<()> {
        self.ensure_transaction(transaction)?;
        let id = self
            .stores
            .values()
            .find(|store| store.info.name == name)
            .map(|store| store.info.id)
            .ok_or_else(|| {
                IdbError::with_message(
                    ErrorKind::InvalidStateError,
                    format!("no object store named {name}"),
                )
            })?;
        let state = self.stores.remove(&id).unwrap();
        self.log(transaction, UndoOp::DeleteObjectStore { state });
        Ok(())
    }

    fn clear_object_store(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
    ) -> IdbResult<()> {
        self.ensure_transaction(transaction)?;
        let store = self.store_mut(object_store)?;
        let records = std::mem::take(&mut store.records);
        let indexes = std::mem::take(&mut store.indexes);
        self.log(transaction, UndoOp::ClearObjectStore {
            id: object_store,
            records,
            indexes,
        });
        Ok(())
    }

    fn create_index(&mut self, transaction: TransactionId, info: &IndexInfo) -> IdbResult<()> {
        self.ensure_transaction(transaction)?;
        let store = self.store_mut(info.object_store)?;
        if store.info.index(info.id).is_some() || store.info.has_index_named(&info.name) {
            return Err(IdbError::with_message(
                ErrorKind::ConstraintError,
                format!("index {} already exists", info.name),
            ));
        }

        // Backfill from the existing records, refusing the index outright on
        // a uniqueness violation.
        let mut entries = IndexEntries::new();
        for (key, value) in &store.records {
            let Some(index_key) = extract_index_key(value, &info.key_path) else {
                continue;
            };
            let primaries: &mut BTreeSet<KeyData> = entries.entry(index_key).or_default();
            if info.unique && !primaries.is_empty() {
                return Err(IdbError::with_message(
                    ErrorKind::ConstraintError,
                    format!("existing records violate unique index {}", info.name),
                ));
            }
            primaries.insert(key.clone());
        }

        store.info.add_existing_index(info.clone());
        store.indexes.insert(info.id, entries);
        self.log(transaction, UndoOp::CreateIndex {
            store: info.object_store,
            index: info.id,
        });
        Ok(())
    }

    fn generate_key_number(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
    ) -> IdbResult<u64> {
        self.ensure_transaction(transaction)?;
        let store = self.store_mut(object_store)?;
        let prior = store.key_generator;
        store.key_generator += 1;
        let number = store.key_generator;
        self.log(transaction, UndoOp::BumpKeyGenerator {
            store: object_store,
            prior,
        });
        Ok(number)
    }

    fn key_exists_in_object_store(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        key: &KeyData,
    ) -> IdbResult<bool> {
        self.ensure_transaction(transaction)?;
        let store = self.store_mut(object_store)?;
        Ok(key.is_valid() && store.records.contains_key(key))
    }

    fn put_record(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        key: &KeyData,
        value: &Bytes,
    ) -> IdbResult<()> {
        self.ensure_transaction(transaction)?;
        if !key.is_valid() {
            return Err(IdbError::with_message(
                ErrorKind::DataError,
                "record key is not a valid key",
            ));
        }
        let store = self.store_mut(object_store)?;
        store.check_unique_constraints(key, value)?;

        let mut generator_bump = None;
        if store.info.auto_increment {
            // An explicit numeric key moves the generator past it so later
            // generated keys never collide.
            if let Some(number) = key.as_number() {
                if number > 0 && number as u64 > store.key_generator {
                    generator_bump = Some(store.key_generator);
                    store.key_generator = number as u64;
                }
            }
        }

        let prior = store.records.insert(key.clone(), value.clone());
        if let Some(prior_value) = &prior {
            store.remove_index_entries(key, prior_value);
        }
        store.add_index_entries(key, value);

        if let Some(prior_generator) = generator_bump {
            self.log(transaction, UndoOp::BumpKeyGenerator {
                store: object_store,
                prior: prior_generator,
            });
        }
        self.log(transaction, UndoOp::PutRecord {
            store: object_store,
            key: key.clone(),
            prior,
        });
        Ok(())
    }

    fn delete_range(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        range: &KeyRange,
    ) -> IdbResult<()> {
        self.ensure_transaction(transaction)?;
        let store = self.store_mut(object_store)?;
        let keys: Vec<KeyData> = store
            .records
            .keys()
            .filter(|key| range.contains(key))
            .cloned()
            .collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            let value = store.records.remove(&key).unwrap();
            store.remove_index_entries(&key, &value);
            removed.push((key, value));
        }
        for (key, value) in removed {
            self.log(transaction, UndoOp::DeleteRecord {
                store: object_store,
                key,
                value,
            });
        }
        Ok(())
    }

    fn get_record(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        range: &KeyRange,
    ) -> IdbResult<Option<Bytes>> {
        self.ensure_transaction(transaction)?;
        let store = self.store_mut(object_store)?;
        Ok(store
            .records
            .iter()
            .find(|(key, _)| range.contains(key))
            .map(|(_, value)| value.clone()))
    }

    fn get_index_record(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        index: IndexId,
        record_type: IndexRecordType,
        range: &KeyRange,
    ) -> IdbResult<GetResult> {
        self.ensure_transaction(transaction)?;
        let store = self.store_mut(object_store)?;
        let entries = store.indexes.get(&index).ok_or_else(|| {
            IdbError::with_message(ErrorKind::InvalidStateError, format!("no index {index}"))
        })?;

        let primary = entries
            .iter()
            .find(|(index_key, _)| range.contains(index_key))
            .and_then(|(_, primaries)| primaries.iter().next().cloned());
        let Some(primary) = primary else {
            return Ok(GetResult::empty());
        };
        match record_type {
            IndexRecordType::Key => Ok(GetResult::new(primary, None)),
            IndexRecordType::Value => {
                let value = store.records.get(&primary).cloned();
                Ok(GetResult::new(primary, value))
            }
        }
    }

    fn get_count(
        &mut self,
        transaction: TransactionId,
        object_store: ObjectStoreId,
        index: Option<IndexId>,
        range: &KeyRange,
    ) -> IdbResult<u64> {
        self.ensure_transaction(transaction)?;
        let store = self.store_mut(object_store)?;
        let count = match index {
            None => store.records.keys().filter(|key| range.contains(key)).count(),
            Some(index) => {
                let entries = store.indexes.get(&index).ok_or_else(|| {
                    IdbError::with_message(
                        ErrorKind::InvalidStateError,
                        format!("no index {index}"),
                    )
                })?;
                entries
                    .iter()
                    .filter(|(index_key, _)| range.contains(index_key))
                    .map(|(_, primaries)| primaries.len())
                    .sum()
            }
        };
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(json: serde_json::Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&json).unwrap())
    }

    fn store_with_transaction() -> (MemoryBackingStore, TransactionId, ObjectStoreId) {
        let mut store = MemoryBackingStore::new();
        let tx = TransactionId(1);
        store
            .begin_transaction(&TransactionInfo::version_change(tx, 1))
            .unwrap();
        let info = ObjectStoreInfo::new(ObjectStoreId(1), "people", None, true);
        store.create_object_store(tx, &info).unwrap();
        (store, tx, info.id)
    }

    #[test]
    fn establishes_empty_database() {
        let mut store = MemoryBackingStore::new();
        let info = store.get_or_establish_info().unwrap();
        assert_eq!(info.version(), 0);
        assert!(info.object_store_ids().is_empty());
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let (mut store, tx, os) = store_with_transaction();
        let alice = value(serde_json::json!({"name": "alice"}));

        store.put_record(tx, os, &KeyData::number(1), &alice).unwrap();
        assert!(store
            .key_exists_in_object_store(tx, os, &KeyData::number(1))
            .unwrap());
        assert_eq!(
            store
                .get_record(tx, os, &KeyRange::only(KeyData::number(1)))
                .unwrap(),
            Some(alice)
        );
        assert_eq!(store.get_count(tx, os, None, &KeyRange::all()).unwrap(), 1);

        store
            .delete_range(tx, os, &KeyRange::only(KeyData::number(1)))
            .unwrap();
        assert_eq!(store.get_count(tx, os, None, &KeyRange::all()).unwrap(), 0);
    }

    #[test]
    fn generated_keys_skip_past_explicit_numeric_keys() {
        let (mut store, tx, os) = store_with_transaction();
        assert_eq!(store.generate_key_number(tx, os).unwrap(), 1);

        let v = value(serde_json::json!({}));
        store.put_record(tx, os, &KeyData::number(10), &v).unwrap();
        assert_eq!(store.generate_key_number(tx, os).unwrap(), 11);
    }

    #[test]
    fn abort_rolls_back_schema_and_records() {
        let mut store = MemoryBackingStore::new();
        let setup = TransactionId(1);
        store
            .begin_transaction(&TransactionInfo::version_change(setup, 3))
            .unwrap();
        let os = ObjectStoreInfo::new(ObjectStoreId(1), "a", None, false);
        store.create_object_store(setup, &os).unwrap();
        store
            .put_record(setup, os.id, &KeyData::number(1), &value(serde_json::json!(1)))
            .unwrap();
        store.commit_transaction(setup).unwrap();
        assert_eq!(store.get_or_establish_info().unwrap().version(), 3);

        let aborted = TransactionId(2);
        store
            .begin_transaction(&TransactionInfo::version_change(aborted, 4))
            .unwrap();
        let other = ObjectStoreInfo::new(ObjectStoreId(2), "b", None, false);
        store.create_object_store(aborted, &other).unwrap();
        store.delete_object_store(aborted, "a").unwrap();
        store.abort_transaction(aborted).unwrap();

        let info = store.get_or_establish_info().unwrap();
        assert_eq!(info.version(), 3);
        assert_eq!(info.object_store_ids(), vec![os.id]);

        // The record in "a" survived the aborted delete.
        let roundtrip = TransactionId(3);
        store
            .begin_transaction(&TransactionInfo::new(
                roundtrip,
                TransactionMode::ReadOnly,
                vec![os.id],
            ))
            .unwrap();
        assert_eq!(
            store.get_count(roundtrip, os.id, None, &KeyRange::all()).unwrap(),
            1
        );
    }

    #[test]
    fn index_key_paths_and_uniqueness() {
        let (mut store, tx, os) = store_with_transaction();
        store
            .put_record(
                tx,
                os,
                &KeyData::number(1),
                &value(serde_json::json!({"profile": {"email": "a@x"}})),
            )
            .unwrap();

        let index = IndexInfo::new(IndexId(1), "by_email", os, "profile.email", true);
        store.create_index(tx, &index).unwrap();

        let hit = store
            .get_index_record(
                tx,
                os,
                index.id,
                IndexRecordType::Key,
                &KeyRange::only(KeyData::string("a@x")),
            )
            .unwrap();
        assert_eq!(hit.key, Some(KeyData::number(1)));

        // A second record with the same email violates the unique index.
        let error = store
            .put_record(
                tx,
                os,
                &KeyData::number(2),
                &value(serde_json::json!({"profile": {"email": "a@x"}})),
            )
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ConstraintError);

        // Overwriting the owning record itself is fine.
        store
            .put_record(
                tx,
                os,
                &KeyData::number(1),
                &value(serde_json::json!({"profile": {"email": "a@x"}})),
            )
            .unwrap();

        assert_eq!(
            store
                .get_count(tx, os, Some(index.id), &KeyRange::all())
                .unwrap(),
            1
        );
    }

    #[test]
    fn backfilled_index_rejects_duplicates() {
        let (mut store, tx, os) = store_with_transaction();
        for key in 1..=2 {
            store
                .put_record(
                    tx,
                    os,
                    &KeyData::number(key),
                    &value(serde_json::json!({"tag": "same"})),
                )
                .unwrap();
        }
        let unique = IndexInfo::new(IndexId(1), "by_tag", os, "tag", true);
        assert_eq!(
            store.create_index(tx, &unique).unwrap_err().kind(),
            ErrorKind::ConstraintError
        );

        let relaxed = IndexInfo::new(IndexId(1), "by_tag", os, "tag", false);
        store.create_index(tx, &relaxed).unwrap();
        assert_eq!(
            store
                .get_count(tx, os, Some(relaxed.id), &KeyRange::all())
                .unwrap(),
            2
        );
    }

    #[test]
    fn operations_require_a_live_transaction() {
        let mut store = MemoryBackingStore::new();
        let error = store
            .get_record(TransactionId(9), ObjectStoreId(1), &KeyRange::all())
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidStateError);
    }
}
