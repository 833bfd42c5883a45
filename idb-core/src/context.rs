// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::metrics::Metrics;

/// Identity of one logical database: the origin it belongs to and its name.
/// Opaque to the coordinator; the backing store derives its on-disk location
/// from it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseIdentifier {
    pub origin: String,
    pub name: String,
}

impl DatabaseIdentifier {
    pub fn new(origin: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DatabaseIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.name)
    }
}

/// Operational parameters of one database server instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Parameters {
    /// Directory the backing store may persist under. `None` for stores that
    /// keep everything in memory.
    pub db_path: Option<PathBuf>,
}

/// Context contains the per-database identity, parameters and metrics shared
/// by all components of this server.
#[derive(Clone)]
pub(crate) struct Context {
    pub identifier: DatabaseIdentifier,
    pub parameters: Parameters,
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub(crate) fn new(
        identifier: DatabaseIdentifier,
        parameters: Parameters,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            identifier,
            parameters,
            metrics,
        }
    }

    /// Create a test context backed by a temporary directory.
    #[cfg(test)]
    pub(crate) fn new_for_test() -> Self {
        let temp_dir = tempfile::TempDir::new().unwrap();
        Context::new(
            DatabaseIdentifier::new("https://example.com", "test-db"),
            Parameters {
                db_path: Some(temp_dir.into_path()),
            },
            crate::metrics::test_metrics(),
        )
    }
}
