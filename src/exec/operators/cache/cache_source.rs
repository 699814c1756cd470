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
//! Consumer side of a shared cache.
//!
//! Responsibilities:
//! - Streams the finalized cache snapshot to one destination operator.
//! - Exposes the cache's finished dependency so a scheduler can park the driver until the
//!   cache is finalized, failed or cancelled. A woken driver pulls the stored error.
//!
//! Key exported interfaces:
//! - Types: `CacheSourceFactory`, `CacheSourceOperator`.

use std::sync::Arc;

use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::operators::cache::cache_shared::{CacheSharedState, CacheSnapshot};
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{SourceOperator, SourceOperatorFactory};
use crate::exec::pipeline::shared_state::BasicSharedState;
use crate::pipecache_logging::debug;
use crate::runtime::runtime_state::RuntimeState;

pub struct CacheSourceFactory {
    name: String,
    consumer_id: i32,
    cache: Arc<CacheSharedState>,
}

impl CacheSourceFactory {
    pub fn new(consumer_id: i32, cache: Arc<CacheSharedState>) -> Self {
        let name = format!("CACHE_SOURCE (id={}, cache={})", consumer_id, cache.id());
        Self {
            name,
            consumer_id,
            cache,
        }
    }
}

impl SourceOperatorFactory for CacheSourceFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn plan_node_id(&self) -> i32 {
        self.consumer_id
    }

    fn create(&self, _dop: i32, driver_id: i32) -> Box<dyn SourceOperator> {
        Box::new(CacheSourceOperator {
            name: self.name.clone(),
            driver_id,
            consumer_id: self.consumer_id,
            cache: Arc::clone(&self.cache),
            snapshot: None,
            next: 0,
            finished: false,
        })
    }
}

pub struct CacheSourceOperator {
    name: String,
    driver_id: i32,
    consumer_id: i32,
    cache: Arc<CacheSharedState>,
    snapshot: Option<Arc<CacheSnapshot>>,
    next: usize,
    finished: bool,
}

impl SourceOperator for CacheSourceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self, state: &RuntimeState) -> ExecResult<()> {
        let _ = state;
        // Entitlement does not depend on finalize; refuse foreign consumers early.
        if !self.cache.related_op_ids().contains(&self.consumer_id) {
            return Err(ExecError::internal(format!(
                "operator {} is not a destination of cache {}",
                self.consumer_id,
                self.cache.id()
            )));
        }
        Ok(())
    }

    fn has_output(&self) -> bool {
        !self.finished && self.cache.is_terminal()
    }

    fn pull_chunk(&mut self, state: &RuntimeState) -> ExecResult<Option<Chunk>> {
        if state.is_cancelled() {
            return Err(ExecError::cancelled(
                state
                    .cancel_reason()
                    .unwrap_or_else(|| "query cancelled".to_string()),
            ));
        }
        if self.finished {
            return Ok(None);
        }
        let snapshot = match self.snapshot.as_ref() {
            Some(snapshot) => Arc::clone(snapshot),
            None => {
                let snapshot = self.cache.read(self.consumer_id)?;
                debug!(
                    "{} opened snapshot: driver_id={} chunks={} rows={}",
                    self.name,
                    self.driver_id,
                    snapshot.num_chunks(),
                    snapshot.num_rows()
                );
                self.snapshot = Some(Arc::clone(&snapshot));
                snapshot
            }
        };
        match snapshot.chunks().get(self.next) {
            Some(chunk) => {
                self.next += 1;
                Ok(Some(chunk.clone()))
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn close(&mut self) -> ExecResult<()> {
        self.snapshot = None;
        self.finished = true;
        Ok(())
    }

    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        Some(self.cache.finished_dependency())
    }
}
