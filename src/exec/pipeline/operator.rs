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
//! Pull contract for operators that read a published shared state.
//!
//! Responsibilities:
//! - Defines the per-driver runtime operator on the consuming side of a sink.
//! - Separates plan-time factories from per-driver runtime instances.
//!
//! Key exported interfaces:
//! - Types: `SourceOperator`, `SourceOperatorFactory`.

use crate::common::status::ExecResult;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::runtime::runtime_state::RuntimeState;

pub trait SourceOperator: Send {
    fn name(&self) -> &str;

    fn prepare(&mut self, state: &RuntimeState) -> ExecResult<()> {
        let _ = state;
        Ok(())
    }

    fn has_output(&self) -> bool;

    /// Next chunk, or `None` once the operator is exhausted.
    fn pull_chunk(&mut self, state: &RuntimeState) -> ExecResult<Option<Chunk>>;

    fn set_finishing(&mut self, state: &RuntimeState) -> ExecResult<()>;

    fn is_finished(&self) -> bool;

    fn close(&mut self) -> ExecResult<()> {
        Ok(())
    }

    /// Dependency that must be ready before the operator can make progress.
    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        None
    }
}

pub trait SourceOperatorFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Plan node the created operators run for.
    fn plan_node_id(&self) -> i32;

    fn create(&self, dop: i32, driver_id: i32) -> Box<dyn SourceOperator>;
}
