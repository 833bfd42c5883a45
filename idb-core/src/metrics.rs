// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

pub(crate) fn initialise_metrics(registry: Registry) -> Arc<Metrics> {
    Arc::new(Metrics::new(&registry))
}

pub(crate) struct Metrics {
    /// Transactions waiting in the scheduling queue.
    pub pending_transactions: IntGauge,
    /// Transactions activated in the backing store and not yet finished.
    pub in_progress_transactions: IntGauge,
    /// Connections in the open set.
    pub open_connections: IntGauge,
    /// Connections closed by their client but still holding transactions.
    pub close_pending_connections: IntGauge,
    /// Scheduler wake-ups that actually ran.
    pub scheduler_ticks: IntCounter,
    /// Tasks posted to the storage thread.
    pub storage_tasks: IntCounter,
    /// Replies received from the storage thread.
    pub storage_replies: IntCounter,
    /// Operation failures surfaced to clients, by error kind.
    pub operation_errors: IntCounterVec,
}

impl Metrics {
    fn new(registry: &Registry) -> Self {
        Self {
            pending_transactions: register_int_gauge_with_registry!(
                "idb_pending_transactions",
                "Transactions waiting in the scheduling queue",
                registry,
            )
            .unwrap(),
            in_progress_transactions: register_int_gauge_with_registry!(
                "idb_in_progress_transactions",
                "Transactions activated in the backing store and not yet finished",
                registry,
            )
            .unwrap(),
            open_connections: register_int_gauge_with_registry!(
                "idb_open_connections",
                "Connections in the open set",
                registry,
            )
            .unwrap(),
            close_pending_connections: register_int_gauge_with_registry!(
                "idb_close_pending_connections",
                "Connections closed by their client but still holding transactions",
                registry,
            )
            .unwrap(),
            scheduler_ticks: register_int_counter_with_registry!(
                "idb_scheduler_ticks",
                "Scheduler wake-ups that actually ran",
                registry,
            )
            .unwrap(),
            storage_tasks: register_int_counter_with_registry!(
                "idb_storage_tasks",
                "Tasks posted to the storage thread",
                registry,
            )
            .unwrap(),
            storage_replies: register_int_counter_with_registry!(
                "idb_storage_replies",
                "Replies received from the storage thread",
                registry,
            )
            .unwrap(),
            operation_errors: register_int_counter_vec_with_registry!(
                "idb_operation_errors",
                "Operation failures surfaced to clients, by error kind",
                &["kind"],
                registry,
            )
            .unwrap(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_metrics() -> Arc<Metrics> {
    initialise_metrics(Registry::new())
}
