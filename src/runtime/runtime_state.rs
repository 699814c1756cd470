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
use std::sync::Arc;

use crate::common::config;
use crate::common::types::UniqueId;
use crate::runtime::mem_tracker::{self, MemTracker};
use crate::runtime::query_context::{QueryContext, QueryId};

/// Query options relevant to this backend. Unset values fall back to process config.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub batch_size: Option<usize>,
    pub cache_sink_max_bytes: Option<u64>,
    pub cache_sink_max_chunks: Option<usize>,
}

/// Effective caps for one shared cache. Zero means unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheSinkOptions {
    pub max_bytes: u64,
    pub max_chunks: usize,
}

impl CacheSinkOptions {
    pub const UNLIMITED: CacheSinkOptions = CacheSinkOptions {
        max_bytes: 0,
        max_chunks: 0,
    };
}

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: std::sync::Mutex<Option<String>>,
}

impl RuntimeErrorState {
    pub fn set_error(&self, err: String) {
        let mut guard = self.error.lock().expect("runtime error lock");
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("runtime error lock").clone()
    }
}

/// Per fragment-instance state handed by reference into every lifecycle call.
/// Clones share the error state, query context and memory tracker.
#[derive(Clone, Debug, Default)]
pub struct RuntimeState {
    query_options: QueryOptions,
    query_ctx: Option<Arc<QueryContext>>,
    fragment_instance_id: Option<UniqueId>,
    error_state: Arc<RuntimeErrorState>,
    mem_tracker: Option<Arc<MemTracker>>,
}

impl RuntimeState {
    pub fn new(
        query_ctx: Arc<QueryContext>,
        fragment_instance_id: UniqueId,
        query_options: QueryOptions,
    ) -> Self {
        let mem_tracker =
            MemTracker::new_child(fragment_instance_id.label("fragment"), &query_ctx.mem_tracker());
        Self {
            query_options,
            query_ctx: Some(query_ctx),
            fragment_instance_id: Some(fragment_instance_id),
            error_state: Arc::new(RuntimeErrorState::default()),
            mem_tracker: Some(mem_tracker),
        }
    }

    pub fn query_options(&self) -> &QueryOptions {
        &self.query_options
    }

    pub fn query_context(&self) -> Option<&Arc<QueryContext>> {
        self.query_ctx.as_ref()
    }

    pub fn query_id(&self) -> Option<QueryId> {
        self.query_ctx.as_ref().map(|ctx| ctx.query_id())
    }

    pub fn fragment_instance_id(&self) -> Option<UniqueId> {
        self.fragment_instance_id
    }

    /// Fragment tracker, or the process tracker for states built without a query.
    pub fn mem_tracker(&self) -> Arc<MemTracker> {
        self.mem_tracker
            .clone()
            .unwrap_or_else(mem_tracker::process_mem_tracker)
    }

    pub fn is_cancelled(&self) -> bool {
        self.query_ctx
            .as_ref()
            .map(|ctx| ctx.is_cancelled())
            .unwrap_or(false)
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.query_ctx.as_ref().and_then(|ctx| ctx.cancel_reason())
    }

    pub fn error_state(&self) -> Arc<RuntimeErrorState> {
        Arc::clone(&self.error_state)
    }

    pub fn error(&self) -> Option<String> {
        self.error_state.error()
    }

    /// Return the maximum row count per in-memory chunk.
    pub fn chunk_size(&self) -> usize {
        self.query_options
            .batch_size
            .filter(|v| *v > 0)
            .unwrap_or(4096)
    }

    pub fn cache_sink_options(&self) -> CacheSinkOptions {
        CacheSinkOptions {
            max_bytes: self
                .query_options
                .cache_sink_max_bytes
                .unwrap_or_else(config::cache_sink_max_bytes),
            max_chunks: self
                .query_options
                .cache_sink_max_chunks
                .unwrap_or_else(config::cache_sink_max_chunks),
        }
    }
}
