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
//! Per-query execution context shared by every fragment of a query.
//!
//! Responsibilities:
//! - Owns the query memory tracker (optionally limited).
//! - Carries the query-wide cancellation flag observed by running operators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::config;
use crate::common::types::UniqueId;
use crate::pipecache_logging::info;
use crate::runtime::mem_tracker::{self, MemTracker};

pub type QueryId = UniqueId;

#[derive(Debug)]
pub struct QueryContext {
    query_id: QueryId,
    mem_tracker: Arc<MemTracker>,
    cancelled: AtomicBool,
    cancel_reason: Mutex<Option<String>>,
}

impl QueryContext {
    /// Create a query context; the tracker limit comes from process config.
    pub fn new(query_id: QueryId) -> Arc<Self> {
        let limit = config::query_mem_limit_bytes()
            .map(|v| i64::try_from(v).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        Self::with_mem_limit(query_id, limit)
    }

    /// Create a query context with an explicit memory limit. Negative means unlimited.
    pub fn with_mem_limit(query_id: QueryId, mem_limit: i64) -> Arc<Self> {
        let process = mem_tracker::process_mem_tracker();
        let mem_tracker =
            MemTracker::new_child_with_limit(query_id.label("query"), mem_limit, &process);
        Arc::new(Self {
            query_id,
            mem_tracker,
            cancelled: AtomicBool::new(false),
            cancel_reason: Mutex::new(None),
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn mem_tracker(&self) -> Arc<MemTracker> {
        Arc::clone(&self.mem_tracker)
    }

    /// Mark the query cancelled. Only the first reason is kept.
    /// Returns `true` when this call performed the transition.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        {
            let mut guard = self.cancel_reason.lock().expect("query cancel reason lock");
            if guard.is_some() {
                return false;
            }
            *guard = Some(reason.clone());
        }
        self.cancelled.store(true, Ordering::Release);
        info!(query_id = %self.query_id, reason = %reason, "query cancelled");
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason
            .lock()
            .expect("query cancel reason lock")
            .clone()
    }
}
