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
//! Sink operator capability set.
//!
//! Responsibilities:
//! - Splits a sink into a fragment-level operator (one per fragment, shared by all
//!   tasks) and a per-task local state created from it.
//! - Fixes the lifecycle the driver follows: `init -> open -> sink* -> sink(eos) -> close`.
//!
//! Key exported interfaces:
//! - Types: `DataSinkOperator`, `SinkLocalState`, `LocalSinkStateInfo`, `DataSinkDescriptor`.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use crate::common::status::ExecResult;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::shared_state::BasicSharedState;
use crate::runtime::runtime_state::RuntimeState;

/// Plan-provided sink description used by descriptor-configured sinks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataSinkDescriptor {
    pub sink_type: String,
    pub properties: BTreeMap<String, String>,
}

/// Wiring handed to a local state by the framework at task setup.
pub struct LocalSinkStateInfo<S> {
    pub driver_id: i32,
    pub child_id: i32,
    pub dest_ids: Vec<i32>,
    pub shared_state: Weak<S>,
}

impl<S> Clone for LocalSinkStateInfo<S> {
    fn clone(&self) -> Self {
        Self {
            driver_id: self.driver_id,
            child_id: self.child_id,
            dest_ids: self.dest_ids.clone(),
            shared_state: Weak::clone(&self.shared_state),
        }
    }
}

/// Per-task execution state bound to one parallel instance of a sink.
pub trait SinkLocalState: Send {
    type SharedState: BasicSharedState;

    fn init(
        &mut self,
        state: &RuntimeState,
        info: LocalSinkStateInfo<Self::SharedState>,
    ) -> ExecResult<()>;

    fn open(&mut self, state: &RuntimeState) -> ExecResult<()>;

    fn close(&mut self, state: &RuntimeState) -> ExecResult<()> {
        let _ = state;
        Ok(())
    }
}

/// Fragment-level sink descriptor selected at pipeline-build time.
pub trait DataSinkOperator: Send + Sync {
    type SharedState: BasicSharedState;
    type LocalState: SinkLocalState<SharedState = Self::SharedState>;

    fn name(&self) -> &str;

    fn operator_id(&self) -> i32;

    fn child_id(&self) -> i32;

    fn dests_id(&self) -> &[i32];

    /// Descriptor-based initialization path.
    fn init(&mut self, tsink: &DataSinkDescriptor) -> ExecResult<()>;

    /// Build the state shared by `num_producers` parallel tasks of this fragment.
    fn create_shared_state(&self, num_producers: usize) -> Arc<Self::SharedState>;

    fn create_local_state(&self, driver_id: i32) -> Self::LocalState;

    /// Consume one chunk from a task. `eos` marks the task's last call.
    fn sink(
        &self,
        state: &RuntimeState,
        local: &mut Self::LocalState,
        chunk: Chunk,
        eos: bool,
    ) -> ExecResult<()>;
}
