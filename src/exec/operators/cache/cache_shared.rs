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
//! Shared cache state written by every task of a cache sink.
//!
//! Responsibilities:
//! - Accumulates chunks from concurrent producers under a single lock.
//! - Runs the producer fan-in barrier; the last finishing producer finalizes.
//! - Publishes an immutable snapshot to the destination ids fixed at construction.
//!
//! Key exported interfaces:
//! - Types: `CacheSharedState`, `CacheSnapshot`, `CacheStatus`, `CacheStats`.
//!
//! Current limitations:
//! - Content is held in memory only; there is no spill or persistent backing store.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock};

use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};
use crate::exec::pipeline::shared_state::BasicSharedState;
use crate::pipecache_logging::{debug, info, warn};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::{CacheSinkOptions, RuntimeState};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Producers are still appending.
    Building,
    /// Finalized; readable by related operators.
    Ready,
    /// An append failed; content was discarded.
    Failed(ExecError),
    /// The query was cancelled before finalize; content was discarded.
    Cancelled(String),
}

impl CacheStatus {
    fn as_error(&self) -> Option<ExecError> {
        match self {
            CacheStatus::Failed(err) => Some(err.clone()),
            CacheStatus::Cancelled(reason) => Some(ExecError::Cancelled(reason.clone())),
            CacheStatus::Building | CacheStatus::Ready => None,
        }
    }
}

/// Finalized cache content. Chunks keep the order in which they were appended.
#[derive(Debug)]
pub struct CacheSnapshot {
    chunks: Vec<Chunk>,
    num_rows: usize,
    num_bytes: usize,
}

impl CacheSnapshot {
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub num_rows: usize,
    pub num_bytes: usize,
    pub num_chunks: usize,
    pub num_producers: usize,
    pub finished_producers: usize,
}

#[derive(Default)]
struct CacheAccumulator {
    chunks: Vec<Chunk>,
    num_rows: usize,
    num_bytes: usize,
}

struct CacheInner {
    status: CacheStatus,
    acc: CacheAccumulator,
    remaining_producers: usize,
    snapshot: Option<Arc<CacheSnapshot>>,
}

pub struct CacheSharedState {
    id: i32,
    related_op_ids: BTreeSet<i32>,
    num_producers: usize,
    inner: Mutex<CacheInner>,
    ready_dep: DependencyHandle,
    finished_dep: DependencyHandle,
    options: OnceLock<CacheSinkOptions>,
    mem_tracker: OnceLock<Arc<MemTracker>>,
}

impl std::fmt::Debug for CacheSharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSharedState")
            .field("id", &self.id)
            .field("related_op_ids", &self.related_op_ids)
            .field("num_producers", &self.num_producers)
            .field("status", &self.status())
            .finish()
    }
}

impl CacheSharedState {
    /// `num_producers` below one is raised to one; `SinkPipeline::new` rejects zero
    /// before it gets here.
    pub fn new(id: i32, related_op_ids: impl IntoIterator<Item = i32>, num_producers: usize) -> Self {
        let num_producers = num_producers.max(1);
        Self {
            id,
            related_op_ids: related_op_ids.into_iter().collect(),
            num_producers,
            inner: Mutex::new(CacheInner {
                status: CacheStatus::Building,
                acc: CacheAccumulator::default(),
                remaining_producers: num_producers,
                snapshot: None,
            }),
            ready_dep: Dependency::new(format!("cache_ready:{id}")),
            finished_dep: Dependency::new(format!("cache_finished:{id}")),
            options: OnceLock::new(),
            mem_tracker: OnceLock::new(),
        }
    }

    pub fn num_producers(&self) -> usize {
        self.num_producers
    }

    /// Bind caps and the memory tracker. The first producer to open wins; later
    /// calls return the already bound tracker.
    pub fn bind(&self, state: &RuntimeState) -> Arc<MemTracker> {
        let options = *self.options.get_or_init(|| state.cache_sink_options());
        let tracker = self.mem_tracker.get_or_init(|| {
            debug!(
                "CacheSharedState bind: id={} max_bytes={} max_chunks={} related_op_ids={:?}",
                self.id, options.max_bytes, options.max_chunks, self.related_op_ids
            );
            MemTracker::new_child(format!("cache_sink_{}", self.id), &state.mem_tracker())
        });
        Arc::clone(tracker)
    }

    pub fn mem_tracker(&self) -> Option<Arc<MemTracker>> {
        self.mem_tracker.get().cloned()
    }

    fn options(&self) -> CacheSinkOptions {
        self.options
            .get()
            .copied()
            .unwrap_or(CacheSinkOptions::UNLIMITED)
    }

    /// Append one chunk. Empty chunks are accepted and leave the accumulator unchanged.
    pub fn append(&self, mut chunk: Chunk) -> ExecResult<()> {
        let options = self.options();
        let mut discarded = None;
        let result = {
            let mut guard = self.inner.lock().expect("cache shared state lock");
            if let Some(err) = guard.status.as_error() {
                return Err(err);
            }
            if guard.status == CacheStatus::Ready {
                return Err(ExecError::internal(format!(
                    "cache {} already finalized, cannot append",
                    self.id
                )));
            }
            if chunk.is_empty() {
                return Ok(());
            }

            let bytes = chunk.logical_bytes();
            match self.check_caps(&guard.acc, &options, bytes) {
                Err(err) => {
                    guard.status = CacheStatus::Failed(err.clone());
                    discarded = Some(std::mem::take(&mut guard.acc));
                    Err(err)
                }
                Ok(()) => {
                    if let Some(tracker) = self.mem_tracker.get() {
                        chunk.transfer_to(tracker);
                    }
                    guard.acc.num_rows += chunk.len();
                    guard.acc.num_bytes += bytes;
                    guard.acc.chunks.push(chunk);
                    Ok(())
                }
            }
        };
        if let (Some(acc), Err(err)) = (discarded, result.as_ref()) {
            warn!(
                "CacheSharedState append rejected: id={} cached_chunks={} cached_bytes={} err={}",
                self.id,
                acc.chunks.len(),
                acc.num_bytes,
                err
            );
            drop(acc);
            self.finished_dep.set_ready();
        }
        result
    }

    fn check_caps(
        &self,
        acc: &CacheAccumulator,
        options: &CacheSinkOptions,
        bytes: usize,
    ) -> ExecResult<()> {
        if options.max_chunks > 0 && acc.chunks.len() >= options.max_chunks {
            return Err(ExecError::mem_limit_exceeded(format!(
                "cache_sink_{}: chunk count {} reached max_chunks {}",
                self.id,
                acc.chunks.len(),
                options.max_chunks
            )));
        }
        let total = acc.num_bytes.saturating_add(bytes) as u64;
        if options.max_bytes > 0 && total > options.max_bytes {
            return Err(ExecError::mem_limit_exceeded(format!(
                "cache_sink_{}: {} + {} bytes exceeds max_bytes {}",
                self.id, acc.num_bytes, bytes, options.max_bytes
            )));
        }
        if let Some(tracker) = self.mem_tracker.get() {
            let requested = i64::try_from(bytes).unwrap_or(i64::MAX);
            if let Some(violation) = tracker.limit_exceeded_by(requested) {
                return Err(ExecError::mem_limit_exceeded(format!(
                    "cache_sink_{}: {}",
                    self.id, violation
                )));
            }
        }
        Ok(())
    }

    /// Count down one producer. Returns `true` for the call that finalized the cache.
    pub fn finish_producer(&self) -> ExecResult<bool> {
        let finalized = {
            let mut guard = self.inner.lock().expect("cache shared state lock");
            if guard.remaining_producers == 0 {
                return Err(ExecError::internal(format!(
                    "cache {} received more end-of-stream signals than its {} producers",
                    self.id, self.num_producers
                )));
            }
            guard.remaining_producers -= 1;
            if let Some(err) = guard.status.as_error() {
                return Err(err);
            }
            if guard.remaining_producers > 0 {
                false
            } else {
                let acc = std::mem::take(&mut guard.acc);
                guard.snapshot = Some(Arc::new(CacheSnapshot {
                    chunks: acc.chunks,
                    num_rows: acc.num_rows,
                    num_bytes: acc.num_bytes,
                }));
                guard.status = CacheStatus::Ready;
                true
            }
        };
        if finalized {
            let stats = self.stats();
            info!(
                "CacheSharedState finalized: id={} rows={} bytes={} chunks={} producers={} related_op_ids={:?}",
                self.id,
                stats.num_rows,
                stats.num_bytes,
                stats.num_chunks,
                self.num_producers,
                self.related_op_ids
            );
            self.ready_dep.set_ready();
            self.finished_dep.set_ready();
        }
        Ok(finalized)
    }

    pub fn status(&self) -> CacheStatus {
        self.inner
            .lock()
            .expect("cache shared state lock")
            .status
            .clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready_dep.is_ready()
    }

    /// Becomes ready once, when the cache is finalized.
    pub fn ready_dependency(&self) -> DependencyHandle {
        Arc::clone(&self.ready_dep)
    }

    /// True once the status left `Building`, whether by finalize, failure or cancellation.
    pub fn is_terminal(&self) -> bool {
        self.finished_dep.is_ready()
    }

    /// Becomes ready once, on the first transition out of `Building`. Consumers park
    /// on this one so failures reach them as well.
    pub fn finished_dependency(&self) -> DependencyHandle {
        Arc::clone(&self.finished_dep)
    }

    pub fn stats(&self) -> CacheStats {
        let guard = self.inner.lock().expect("cache shared state lock");
        let (num_rows, num_bytes, num_chunks) = match guard.snapshot.as_ref() {
            Some(snapshot) => (snapshot.num_rows, snapshot.num_bytes, snapshot.chunks.len()),
            None => (guard.acc.num_rows, guard.acc.num_bytes, guard.acc.chunks.len()),
        };
        CacheStats {
            num_rows,
            num_bytes,
            num_chunks,
            num_producers: self.num_producers,
            finished_producers: self.num_producers - guard.remaining_producers,
        }
    }

    /// Finalized content for `consumer_id`, which must be one of `related_op_ids`.
    pub fn read(&self, consumer_id: i32) -> ExecResult<Arc<CacheSnapshot>> {
        if !self.related_op_ids.contains(&consumer_id) {
            return Err(ExecError::internal(format!(
                "operator {} is not a destination of cache {} (related_op_ids={:?})",
                consumer_id, self.id, self.related_op_ids
            )));
        }
        let guard = self.inner.lock().expect("cache shared state lock");
        if let Some(err) = guard.status.as_error() {
            return Err(err);
        }
        guard.snapshot.clone().ok_or_else(|| {
            ExecError::internal(format!("cache {} read before finalize", self.id))
        })
    }
}

impl BasicSharedState for CacheSharedState {
    fn id(&self) -> i32 {
        self.id
    }

    fn related_op_ids(&self) -> &BTreeSet<i32> {
        &self.related_op_ids
    }

    /// Abandon a cache that has not been finalized. A ready or failed cache is left untouched.
    fn cancel(&self, reason: &str) -> bool {
        let discarded = {
            let mut guard = self.inner.lock().expect("cache shared state lock");
            if guard.status != CacheStatus::Building {
                return false;
            }
            guard.status = CacheStatus::Cancelled(reason.to_string());
            std::mem::take(&mut guard.acc)
        };
        debug!(
            "CacheSharedState cancelled: id={} discarded_chunks={} reason={}",
            self.id,
            discarded.chunks.len(),
            reason
        );
        drop(discarded);
        self.finished_dep.set_ready();
        true
    }
}
