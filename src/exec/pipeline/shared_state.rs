// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Fragment-level shared state and its owning registry.
//!
//! Responsibilities:
//! - Defines the capability every per-fragment shared state exposes: its owner id
//!   and the destination ids entitled to read it.
//! - Keeps the only strong references to shared states for the fragment lifetime;
//!   per-task local states hold `Weak` back-references obtained from here.
//!
//! Key exported interfaces:
//! - Types: `BasicSharedState`, `SharedStateRegistry`.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use crate::common::status::{ExecError, ExecResult};

pub trait BasicSharedState: Any + Send + Sync {
    /// Id of the operator that created this state.
    fn id(&self) -> i32;

    /// Downstream operator ids allowed to consume this state. Fixed at construction.
    fn related_op_ids(&self) -> &BTreeSet<i32>;

    /// Move the state to a terminal cancelled status and wake its consumers.
    /// Returns `true` when this call performed the transition.
    fn cancel(&self, reason: &str) -> bool {
        let _ = reason;
        false
    }
}

struct RegistryEntry {
    state: Arc<dyn Any + Send + Sync>,
    handle: Arc<dyn BasicSharedState>,
}

#[derive(Default)]
pub struct SharedStateRegistry {
    entries: Mutex<HashMap<i32, RegistryEntry>>,
}

impl SharedStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `state`. One state per operator id.
    pub fn register<T: BasicSharedState>(&self, state: Arc<T>) -> ExecResult<()> {
        let id = state.id();
        let mut guard = self.entries.lock().expect("shared state registry lock");
        if guard.contains_key(&id) {
            return Err(ExecError::internal(format!(
                "shared state for operator {} already registered",
                id
            )));
        }
        guard.insert(
            id,
            RegistryEntry {
                handle: Arc::clone(&state) as Arc<dyn BasicSharedState>,
                state,
            },
        );
        Ok(())
    }

    pub fn get<T: BasicSharedState>(&self, id: i32) -> Option<Arc<T>> {
        let guard = self.entries.lock().expect("shared state registry lock");
        let entry = guard.get(&id)?;
        Arc::clone(&entry.state).downcast::<T>().ok()
    }

    /// Non-owning handle for per-task local states.
    pub fn downgrade<T: BasicSharedState>(&self, id: i32) -> Option<Weak<T>> {
        self.get::<T>(id).map(|state| Arc::downgrade(&state))
    }

    /// Ids of the shared states that `consumer_id` is entitled to read.
    pub fn readable_by(&self, consumer_id: i32) -> Vec<i32> {
        let guard = self.entries.lock().expect("shared state registry lock");
        let mut ids: Vec<i32> = guard
            .iter()
            .filter(|(_, entry)| entry.handle.related_op_ids().contains(&consumer_id))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Cancel every registered state. Returns how many changed status.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let handles: Vec<Arc<dyn BasicSharedState>> = {
            let guard = self.entries.lock().expect("shared state registry lock");
            guard.values().map(|entry| Arc::clone(&entry.handle)).collect()
        };
        handles.iter().filter(|handle| handle.cancel(reason)).count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("shared state registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every strong reference. Called at fragment teardown.
    pub fn clear(&self) {
        let drained: Vec<RegistryEntry> = {
            let mut guard = self.entries.lock().expect("shared state registry lock");
            guard.drain().map(|(_, entry)| entry).collect()
        };
        drop(drained);
    }
}
