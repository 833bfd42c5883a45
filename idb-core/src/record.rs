// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A record key. The ordering across variants follows the IndexedDB key order
/// for the key types supported here: numbers sort before strings, strings
/// before binary. `None` is the invalid key; it is never stored and only
/// appears as the "let the store pick a key" marker on `put_or_add`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyData {
    #[default]
    None,
    Number(i64),
    String(String),
    Binary(Vec<u8>),
}

impl KeyData {
    pub fn number(value: i64) -> Self {
        KeyData::Number(value)
    }

    pub fn string(value: impl Into<String>) -> Self {
        KeyData::String(value.into())
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, KeyData::None)
    }

    /// The numeric value of the key, if it is a number key.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            KeyData::Number(value) => Some(*value),
            _ => None,
        }
    }
}

/// A contiguous range of keys, with optionally open endpoints. An endpoint of
/// `None` is unbounded on that side.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: Option<KeyData>,
    pub upper: Option<KeyData>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    /// The range containing exactly one key.
    pub fn only(key: KeyData) -> Self {
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    pub fn bound(lower: KeyData, upper: KeyData, lower_open: bool, upper_open: bool) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        }
    }

    pub fn lower_bound(lower: KeyData, open: bool) -> Self {
        Self {
            lower: Some(lower),
            upper: None,
            lower_open: open,
            upper_open: false,
        }
    }

    pub fn upper_bound(upper: KeyData, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some(upper),
            lower_open: false,
            upper_open: open,
        }
    }

    /// The unbounded range over all keys.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &KeyData) -> bool {
        if !key.is_valid() {
            return false;
        }
        if let Some(lower) = &self.lower {
            if key < lower || (self.lower_open && key == lower) {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if key > upper || (self.upper_open && key == upper) {
                return false;
            }
        }
        true
    }
}

/// Whether `put_or_add` may replace an existing record with the same key.
/// `NoOverwrite` is the `add` operation and fails with a `ConstraintError`
/// when the key already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverwriteMode {
    Overwrite,
    NoOverwrite,
}

/// What an index lookup should produce: the primary key of the matching
/// record, or its value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexRecordType {
    Key,
    Value,
}

/// Result of a `get_record` operation. An all-`None` result means no record
/// matched the range.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetResult {
    pub key: Option<KeyData>,
    pub value: Option<Bytes>,
}

impl GetResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(key: KeyData, value: Option<Bytes>) -> Self {
        Self {
            key: Some(key),
            value,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.value.is_none()
    }
}
