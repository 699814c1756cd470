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
//! Fragment-level pipeline runtime context.
//!
//! Responsibilities:
//! - Owns the shared states of one fragment execution for its whole lifetime.
//! - Carries the runtime state handed to every driver, plus the final status.
//!
//! Key exported interfaces:
//! - Types: `FragmentContext`.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::status::ExecError;
use crate::exec::pipeline::shared_state::SharedStateRegistry;
use crate::pipecache_logging::{info, warn};
use crate::runtime::runtime_state::RuntimeState;

/// Fragment-scoped runtime context shared across drivers.
pub struct FragmentContext {
    next_driver_id: AtomicI32,
    runtime_state: Arc<RuntimeState>,
    shared_states: SharedStateRegistry,
    final_error: Mutex<Option<ExecError>>,
}

impl FragmentContext {
    pub fn new(runtime_state: Arc<RuntimeState>) -> Self {
        Self {
            next_driver_id: AtomicI32::new(0),
            runtime_state,
            shared_states: SharedStateRegistry::new(),
            final_error: Mutex::new(None),
        }
    }

    pub fn runtime_state(&self) -> &Arc<RuntimeState> {
        &self.runtime_state
    }

    pub fn shared_states(&self) -> &SharedStateRegistry {
        &self.shared_states
    }

    pub fn next_driver_id(&self) -> i32 {
        self.next_driver_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Record a driver failure. The first error wins and cancels the query and every
    /// shared state so sibling drivers and parked consumers stop promptly.
    pub fn set_final_status(&self, err: ExecError) {
        let first = {
            let mut guard = self.final_error.lock().expect("fragment final status lock");
            if guard.is_some() {
                false
            } else {
                *guard = Some(err.clone());
                true
            }
        };
        if !first {
            return;
        }
        self.runtime_state.error_state().set_error(err.to_string());
        if let ExecError::Cancelled(reason) = &err {
            self.shared_states.cancel_all(reason);
            return;
        }
        warn!(
            "fragment failed: fragment_instance_id={:?} err={}",
            self.runtime_state.fragment_instance_id(),
            err
        );
        self.cancel(err.to_string());
    }

    pub fn final_status(&self) -> Option<ExecError> {
        self.final_error
            .lock()
            .expect("fragment final status lock")
            .clone()
    }

    /// Cancel the owning query and every registered shared state. Returns false when
    /// nothing changed status.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let query_cancelled = match self.runtime_state.query_context() {
            Some(ctx) => ctx.cancel(reason.clone()),
            None => false,
        };
        let states_cancelled = self.shared_states.cancel_all(&reason);
        if states_cancelled > 0 {
            info!(
                "fragment cancelled shared states: fragment_instance_id={:?} cancelled={} reason={}",
                self.runtime_state.fragment_instance_id(),
                states_cancelled,
                reason
            );
        }
        query_cancelled || states_cancelled > 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.runtime_state.is_cancelled()
    }

    /// Release every shared state. Weak handles held by finished tasks expire here.
    pub fn teardown(&self) {
        let num_states = self.shared_states.len();
        self.shared_states.clear();
        info!(
            "fragment teardown: fragment_instance_id={:?} released_shared_states={}",
            self.runtime_state.fragment_instance_id(),
            num_states
        );
    }
}
