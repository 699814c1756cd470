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
//! Per-task execution loop for sink operators.
//!
//! Responsibilities:
//! - Drives one local state through `init -> open -> sink* -> sink(eos) -> close`.
//! - Creates and registers the fragment's shared state before any task runs.
//! - Runs the tasks of one sink on a worker pool and reports failures to the fragment.
//!
//! Key exported interfaces:
//! - Types: `SinkPipeline`, `SinkDriver`, `DriverReport`.

use std::sync::mpsc;
use std::sync::{Arc, Weak};

use threadpool::ThreadPool;

use crate::common::config;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::fragment_context::FragmentContext;
use crate::exec::pipeline::sink_operator::{DataSinkOperator, LocalSinkStateInfo, SinkLocalState};
use crate::pipecache_logging::{debug, info, warn};
use crate::runtime::runtime_state::RuntimeState;

/// What one driver pushed into its sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriverReport {
    pub driver_id: i32,
    pub chunks: usize,
    pub rows: usize,
}

/// One sink operator instantiated for a fragment, with its registered shared state.
pub struct SinkPipeline<O: DataSinkOperator> {
    fragment: Arc<FragmentContext>,
    operator: Arc<O>,
    num_drivers: usize,
}

impl<O> SinkPipeline<O>
where
    O: DataSinkOperator + 'static,
    O::LocalState: 'static,
{
    /// Build the shared state for `num_drivers` tasks and hand ownership to the fragment.
    /// A pipeline needs at least one driver.
    pub fn new(
        fragment: Arc<FragmentContext>,
        operator: Arc<O>,
        num_drivers: usize,
    ) -> ExecResult<Self> {
        if num_drivers == 0 {
            return Err(ExecError::internal(format!(
                "{} needs at least one driver",
                operator.name()
            )));
        }
        let shared = operator.create_shared_state(num_drivers);
        fragment.shared_states().register(shared)?;
        debug!(
            "SinkPipeline created: operator={} num_drivers={}",
            operator.name(),
            num_drivers
        );
        Ok(Self {
            fragment,
            operator,
            num_drivers,
        })
    }

    pub fn operator(&self) -> &Arc<O> {
        &self.operator
    }

    pub fn num_drivers(&self) -> usize {
        self.num_drivers
    }

    pub fn shared_state(&self) -> Option<Arc<O::SharedState>> {
        self.fragment
            .shared_states()
            .get::<O::SharedState>(self.operator.operator_id())
    }

    /// Driver for the next task. Holds only a weak reference to the shared state.
    pub fn driver(&self, input: Vec<Chunk>) -> SinkDriver<O> {
        let driver_id = self.fragment.next_driver_id();
        let shared = self
            .fragment
            .shared_states()
            .downgrade::<O::SharedState>(self.operator.operator_id())
            .unwrap_or_default();
        SinkDriver {
            driver_id,
            fragment: Arc::clone(&self.fragment),
            operator: Arc::clone(&self.operator),
            local: self.operator.create_local_state(driver_id),
            shared,
            state: RuntimeState::clone(self.fragment.runtime_state()),
            input,
        }
    }

    /// Run one driver per input on the pipeline worker pool. Results are in input order.
    pub fn run_parallel(&self, inputs: Vec<Vec<Chunk>>) -> Vec<ExecResult<DriverReport>> {
        let num_inputs = inputs.len();
        let threads = config::pipeline_exec_thread_pool_thread_num()
            .min(num_inputs)
            .max(1);
        let pool = ThreadPool::with_name("pipeline_exec".to_string(), threads);
        let (tx, rx) = mpsc::channel();
        for (idx, input) in inputs.into_iter().enumerate() {
            let driver = self.driver(input);
            let tx = tx.clone();
            pool.execute(move || {
                let _ = tx.send((idx, driver.run()));
            });
        }
        drop(tx);
        pool.join();

        let mut results: Vec<ExecResult<DriverReport>> = (0..num_inputs)
            .map(|idx| {
                Err(ExecError::internal(format!(
                    "sink driver {} did not report a result",
                    idx
                )))
            })
            .collect();
        for (idx, result) in rx {
            results[idx] = result;
        }
        info!(
            "SinkPipeline finished: operator={} drivers={} failed={}",
            self.operator.name(),
            num_inputs,
            results.iter().filter(|r| r.is_err()).count()
        );
        results
    }
}

pub struct SinkDriver<O: DataSinkOperator> {
    driver_id: i32,
    fragment: Arc<FragmentContext>,
    operator: Arc<O>,
    local: O::LocalState,
    shared: Weak<O::SharedState>,
    state: RuntimeState,
    input: Vec<Chunk>,
}

impl<O: DataSinkOperator> SinkDriver<O> {
    pub fn driver_id(&self) -> i32 {
        self.driver_id
    }

    pub fn run(mut self) -> ExecResult<DriverReport> {
        let result = self.run_lifecycle();
        if let Err(close_err) = self.local.close(&self.state) {
            warn!(
                "sink driver close failed: operator={} driver_id={} err={}",
                self.operator.name(),
                self.driver_id,
                close_err
            );
        }
        if let Err(err) = result.as_ref() {
            debug!(
                "sink driver failed: operator={} driver_id={} err={}",
                self.operator.name(),
                self.driver_id,
                err
            );
            self.fragment.set_final_status(err.clone());
        }
        result
    }

    fn run_lifecycle(&mut self) -> ExecResult<DriverReport> {
        let info = LocalSinkStateInfo {
            driver_id: self.driver_id,
            child_id: self.operator.child_id(),
            dest_ids: self.operator.dests_id().to_vec(),
            shared_state: Weak::clone(&self.shared),
        };
        self.local.init(&self.state, info)?;
        self.local.open(&self.state)?;

        let mut report = DriverReport {
            driver_id: self.driver_id,
            ..DriverReport::default()
        };
        let input = std::mem::take(&mut self.input);
        if input.is_empty() {
            self.operator
                .sink(&self.state, &mut self.local, Chunk::default(), true)?;
            return Ok(report);
        }
        let last = input.len() - 1;
        for (idx, chunk) in input.into_iter().enumerate() {
            report.chunks += 1;
            report.rows += chunk.len();
            self.operator
                .sink(&self.state, &mut self.local, chunk, idx == last)?;
        }
        Ok(report)
    }
}
