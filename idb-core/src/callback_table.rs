// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::IdbResult;
use crate::record::{GetResult, KeyData};

/// Names an outstanding asynchronous continuation. Ids are allocated by a
/// monotonic counter owned by the main context.
pub(crate) type CallbackId = u64;

/// The continuation of one storage operation, in one of the four reply shapes
/// the operation handlers produce. Collapsing the shapes into one sum type
/// keeps the take site exhaustive: a reply arriving with the wrong shape is a
/// programming error, not a silently dropped callback.
pub(crate) enum Continuation {
    Error(oneshot::Sender<IdbResult<()>>),
    Key(oneshot::Sender<IdbResult<KeyData>>),
    Get(oneshot::Sender<IdbResult<GetResult>>),
    Count(oneshot::Sender<IdbResult<u64>>),
}

/// Correlates storage replies with their typed continuations. Every id is
/// inserted exactly once and taken exactly once; replies may arrive out of
/// issue order.
#[derive(Default)]
pub(crate) struct CallbackTable {
    next_id: CallbackId,
    callbacks: HashMap<CallbackId, Continuation>,
}

impl CallbackTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn store(&mut self, continuation: Continuation) -> CallbackId {
        self.next_id += 1;
        let id = self.next_id;
        let previous = self.callbacks.insert(id, continuation);
        assert!(previous.is_none(), "callback id {id} stored twice");
        id
    }

    fn take(&mut self, id: CallbackId) -> Continuation {
        self.callbacks
            .remove(&id)
            .unwrap_or_else(|| panic!("callback {id} not found or already taken"))
    }

    pub(crate) fn complete_error(&mut self, id: CallbackId, result: IdbResult<()>) {
        match self.take(id) {
            Continuation::Error(sender) => {
                if sender.send(result).is_err() {
                    debug!("caller of callback {id} went away");
                }
            }
            _ => panic!("callback {id} does not have the error shape"),
        }
    }

    pub(crate) fn complete_key(&mut self, id: CallbackId, result: IdbResult<KeyData>) {
        match self.take(id) {
            Continuation::Key(sender) => {
                if sender.send(result).is_err() {
                    debug!("caller of callback {id} went away");
                }
            }
            _ => panic!("callback {id} does not have the key shape"),
        }
    }

    pub(crate) fn complete_get(&mut self, id: CallbackId, result: IdbResult<GetResult>) {
        match self.take(id) {
            Continuation::Get(sender) => {
                if sender.send(result).is_err() {
                    debug!("caller of callback {id} went away");
                }
            }
            _ => panic!("callback {id} does not have the get-result shape"),
        }
    }

    pub(crate) fn complete_count(&mut self, id: CallbackId, result: IdbResult<u64>) {
        match self.take(id) {
            Continuation::Count(sender) => {
                if sender.send(result).is_err() {
                    debug!("caller of callback {id} went away");
                }
            }
            _ => panic!("callback {id} does not have the count shape"),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }
}
