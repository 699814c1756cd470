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
//! Cache sink operator and its per-task local state.
//!
//! Responsibilities:
//! - Feeds every task's chunks into one `CacheSharedState` per fragment.
//! - Validates a task's wiring before it is allowed to open.
//! - Observes query cancellation on every call.
//!
//! Key exported interfaces:
//! - Types: `CacheSinkOperator`, `CacheSinkLocalState`.

use std::sync::{Arc, Weak};

use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::operators::cache::cache_shared::CacheSharedState;
use crate::exec::pipeline::shared_state::BasicSharedState;
use crate::exec::pipeline::sink_operator::{
    DataSinkDescriptor, DataSinkOperator, LocalSinkStateInfo, SinkLocalState,
};
use crate::pipecache_logging::{debug, warn};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;

const CACHE_SINK_NAME: &str = "CACHE_SINK_OPERATOR";

#[derive(Clone, Debug)]
pub struct CacheSinkOperator {
    name: String,
    sink_id: i32,
    child_id: i32,
    dest_ids: Vec<i32>,
}

impl CacheSinkOperator {
    pub fn new(sink_id: i32, child_id: i32, dest_ids: impl IntoIterator<Item = i32>) -> Self {
        Self {
            name: format!("{} (id={})", CACHE_SINK_NAME, sink_id),
            sink_id,
            child_id,
            dest_ids: dest_ids.into_iter().collect(),
        }
    }
}

impl DataSinkOperator for CacheSinkOperator {
    type SharedState = CacheSharedState;
    type LocalState = CacheSinkLocalState;

    fn name(&self) -> &str {
        &self.name
    }

    fn operator_id(&self) -> i32 {
        self.sink_id
    }

    fn child_id(&self) -> i32 {
        self.child_id
    }

    fn dests_id(&self) -> &[i32] {
        &self.dest_ids
    }

    /// A cache sink is built directly from plan wiring and has no descriptor form.
    fn init(&mut self, tsink: &DataSinkDescriptor) -> ExecResult<()> {
        let _ = tsink;
        Err(ExecError::internal(format!(
            "{} should not init with descriptor",
            self.name
        )))
    }

    fn create_shared_state(&self, num_producers: usize) -> Arc<CacheSharedState> {
        Arc::new(CacheSharedState::new(
            self.sink_id,
            self.dest_ids.iter().copied(),
            num_producers,
        ))
    }

    fn create_local_state(&self, driver_id: i32) -> CacheSinkLocalState {
        CacheSinkLocalState {
            driver_id,
            operator_id: self.sink_id,
            child_id: self.child_id,
            dest_ids: self.dest_ids.clone(),
            shared: Weak::new(),
            initialized: false,
            opened: false,
            eos_seen: false,
            mem_tracker: None,
        }
    }

    fn sink(
        &self,
        state: &RuntimeState,
        local: &mut CacheSinkLocalState,
        chunk: Chunk,
        eos: bool,
    ) -> ExecResult<()> {
        if state.is_cancelled() {
            let reason = state
                .cancel_reason()
                .unwrap_or_else(|| "query cancelled".to_string());
            if let Some(shared) = local.shared.upgrade() {
                shared.cancel(&reason);
            }
            debug!(
                "{} observed cancellation: driver_id={} reason={}",
                self.name, local.driver_id, reason
            );
            return Err(ExecError::cancelled(reason));
        }
        if !local.opened {
            return Err(ExecError::internal(format!(
                "{} sink called before open: driver_id={}",
                self.name, local.driver_id
            )));
        }
        if local.eos_seen {
            return Err(ExecError::internal(format!(
                "{} sink called after end of stream: driver_id={}",
                self.name, local.driver_id
            )));
        }
        let shared = local.shared_state()?;

        if let Err(err) = shared.append(chunk) {
            if err.is_mem_limit_exceeded() {
                warn!(
                    "{} rejected chunk: driver_id={} err={}",
                    self.name, local.driver_id, err
                );
            }
            return Err(err);
        }

        if eos {
            local.eos_seen = true;
            let finalized = shared.finish_producer()?;
            debug!(
                "{} task finished: driver_id={} finalized={}",
                self.name, local.driver_id, finalized
            );
        }
        Ok(())
    }
}

pub struct CacheSinkLocalState {
    driver_id: i32,
    operator_id: i32,
    child_id: i32,
    dest_ids: Vec<i32>,
    shared: Weak<CacheSharedState>,
    initialized: bool,
    opened: bool,
    eos_seen: bool,
    mem_tracker: Option<Arc<MemTracker>>,
}

impl CacheSinkLocalState {
    pub fn driver_id(&self) -> i32 {
        self.driver_id
    }

    pub fn is_eos(&self) -> bool {
        self.eos_seen
    }

    pub fn mem_tracker(&self) -> Option<Arc<MemTracker>> {
        self.mem_tracker.clone()
    }

    fn shared_state(&self) -> ExecResult<Arc<CacheSharedState>> {
        self.shared.upgrade().ok_or_else(|| {
            ExecError::internal(format!(
                "cache shared state {} already released: driver_id={}",
                self.operator_id, self.driver_id
            ))
        })
    }
}

impl SinkLocalState for CacheSinkLocalState {
    type SharedState = CacheSharedState;

    fn init(
        &mut self,
        _state: &RuntimeState,
        info: LocalSinkStateInfo<CacheSharedState>,
    ) -> ExecResult<()> {
        if self.initialized {
            return Err(ExecError::init(format!(
                "cache sink local state initialized twice: driver_id={}",
                self.driver_id
            )));
        }
        if info.child_id != self.child_id {
            return Err(ExecError::init(format!(
                "cache sink {} expects child {} but task wired child {}",
                self.operator_id, self.child_id, info.child_id
            )));
        }
        if info.dest_ids != self.dest_ids {
            return Err(ExecError::init(format!(
                "cache sink {} expects destinations {:?} but task wired {:?}",
                self.operator_id, self.dest_ids, info.dest_ids
            )));
        }
        let shared = info.shared_state.upgrade().ok_or_else(|| {
            ExecError::init(format!(
                "cache sink {} has no live shared state",
                self.operator_id
            ))
        })?;
        if shared.id() != self.operator_id {
            return Err(ExecError::init(format!(
                "cache sink {} wired to shared state of operator {}",
                self.operator_id,
                shared.id()
            )));
        }
        self.driver_id = info.driver_id;
        self.shared = info.shared_state;
        self.initialized = true;
        Ok(())
    }

    fn open(&mut self, state: &RuntimeState) -> ExecResult<()> {
        if !self.initialized {
            return Err(ExecError::internal(format!(
                "cache sink local state opened before init: driver_id={}",
                self.driver_id
            )));
        }
        if self.opened {
            return Err(ExecError::internal(format!(
                "cache sink local state opened twice: driver_id={}",
                self.driver_id
            )));
        }
        let shared = self.shared_state()?;
        self.mem_tracker = Some(shared.bind(state));
        self.opened = true;
        Ok(())
    }

    fn close(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.shared = Weak::new();
        self.mem_tracker = None;
        Ok(())
    }
}
