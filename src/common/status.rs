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
//! Execution status values returned by pipeline lifecycle calls.
//!
//! Responsibilities:
//! - Classifies failures surfaced by `init`, `open` and `sink` so callers can tell
//!   caller bugs, wiring mismatches, resource exhaustion and cancellation apart.
//!
//! Key exported interfaces:
//! - Types: `ExecError`, `ExecResult`.

/// Failure kinds reported by sink operators and their local states.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    /// The caller violated an operator contract (wrong init path, sink after eos, ...).
    #[error("internal error: {0}")]
    Internal(String),
    /// Local state wiring does not match the operator configuration.
    #[error("init error: {0}")]
    Init(String),
    /// An accumulator or memory tracker limit would be crossed.
    #[error("memory limit exceeded: {0}")]
    MemLimitExceeded(String),
    /// The query was cancelled. Not a failure of the operator itself.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

pub type ExecResult<T> = Result<T, ExecError>;

impl ExecError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }

    pub fn mem_limit_exceeded(msg: impl Into<String>) -> Self {
        Self::MemLimitExceeded(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_mem_limit_exceeded(&self) -> bool {
        matches!(self, Self::MemLimitExceeded(_))
    }
}
