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
mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pipecache::common::status::ExecError;
use pipecache::exec::chunk::Chunk;
use pipecache::exec::operators::cache::{
    CacheSharedState, CacheSinkOperator, CacheSourceFactory, CacheStatus,
};
use pipecache::exec::pipeline::fragment_context::FragmentContext;
use pipecache::exec::pipeline::operator::{SourceOperator, SourceOperatorFactory};
use pipecache::exec::pipeline::shared_state::BasicSharedState;
use pipecache::exec::pipeline::sink_driver::SinkPipeline;
use pipecache::exec::pipeline::sink_operator::{
    DataSinkDescriptor, DataSinkOperator, LocalSinkStateInfo, SinkLocalState,
};
use pipecache::runtime::query_context::QueryContext;
use pipecache::runtime::runtime_state::{QueryOptions, RuntimeState};

use common::{TestConfig, int_chunk, int_values, new_fragment, unique_query_id};

const SINK_ID: i32 = 3;
const CHILD_ID: i32 = 2;

fn cache_pipeline(
    fragment: &Arc<FragmentContext>,
    dests: &[i32],
    num_drivers: usize,
) -> SinkPipeline<CacheSinkOperator> {
    let op = CacheSinkOperator::new(SINK_ID, CHILD_ID, dests.iter().copied());
    SinkPipeline::new(Arc::clone(fragment), Arc::new(op), num_drivers).expect("sink pipeline")
}

fn finalize_counter(shared: &CacheSharedState) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    shared.ready_dependency().add_waiter(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    hits
}

fn parked_source(shared: &Arc<CacheSharedState>, consumer_id: i32) -> (Box<dyn SourceOperator>, Arc<AtomicUsize>) {
    let mut source = CacheSourceFactory::new(consumer_id, Arc::clone(shared)).create(1, 0);
    source.prepare(&RuntimeState::default()).expect("prepare");
    assert!(!source.has_output());
    let woken = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&woken);
    source
        .precondition_dependency()
        .expect("dependency")
        .add_waiter(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    (source, woken)
}

fn sorted_values(shared: &CacheSharedState, consumer_id: i32) -> Vec<i32> {
    let snapshot = shared.read(consumer_id).expect("read snapshot");
    let mut values: Vec<i32> = snapshot.chunks().iter().flat_map(int_values).collect();
    values.sort_unstable();
    values
}

#[test]
fn test_two_tasks_publish_all_chunks_to_both_destinations() {
    let (_ctx, fragment) = new_fragment("two_tasks", QueryOptions::default());
    let pipeline = cache_pipeline(&fragment, &[7, 12], 2);
    let shared = pipeline.shared_state().expect("shared state");
    assert_eq!(shared.related_op_ids(), &BTreeSet::from([7, 12]));
    let hits = finalize_counter(&shared);

    let results = pipeline.run_parallel(vec![
        vec![int_chunk(&[1]), int_chunk(&[2]), int_chunk(&[3])],
        vec![int_chunk(&[4, 5]), int_chunk(&[6]), int_chunk(&[7])],
    ]);
    for result in results {
        assert_eq!(result.expect("driver").chunks, 3);
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(shared.status(), CacheStatus::Ready);
    assert_eq!(shared.related_op_ids(), &BTreeSet::from([7, 12]));
    assert_eq!(sorted_values(&shared, 7), vec![1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(sorted_values(&shared, 12), vec![1, 2, 3, 4, 5, 6, 7]);
    let stats = shared.stats();
    assert_eq!(stats.num_chunks, 6);
    assert_eq!(stats.num_rows, 7);
    assert_eq!(stats.finished_producers, 2);
    assert_eq!(fragment.shared_states().readable_by(12), vec![SINK_ID]);
    assert!(fragment.final_status().is_none());
}

#[test]
fn test_per_task_order_is_preserved() {
    let (_ctx, fragment) = new_fragment("per_task_order", QueryOptions::default());
    let pipeline = cache_pipeline(&fragment, &[7], 2);
    let shared = pipeline.shared_state().expect("shared state");
    pipeline.run_parallel(vec![
        vec![int_chunk(&[10]), int_chunk(&[11]), int_chunk(&[12])],
        vec![int_chunk(&[20]), int_chunk(&[21]), int_chunk(&[22])],
    ]);
    let snapshot = shared.read(7).expect("read");
    let values: Vec<i32> = snapshot.chunks().iter().flat_map(int_values).collect();
    let task_a: Vec<i32> = values.iter().copied().filter(|v| *v < 20).collect();
    let task_b: Vec<i32> = values.iter().copied().filter(|v| *v >= 20).collect();
    assert_eq!(task_a, vec![10, 11, 12]);
    assert_eq!(task_b, vec![20, 21, 22]);
}

#[test]
fn test_cancellation_after_two_of_three_tasks_leaves_cache_unpublished() {
    let (ctx, fragment) = new_fragment("cancel_mid_stream", QueryOptions::default());
    let pipeline = cache_pipeline(&fragment, &[7], 3);
    let shared = pipeline.shared_state().expect("shared state");
    let hits = finalize_counter(&shared);

    pipeline
        .driver(vec![int_chunk(&[1]), int_chunk(&[2])])
        .run()
        .expect("first task");
    pipeline
        .driver(vec![int_chunk(&[3])])
        .run()
        .expect("second task");
    assert_eq!(shared.stats().finished_producers, 2);

    assert!(ctx.cancel("user cancelled"));
    let err = pipeline
        .driver(vec![int_chunk(&[4]), int_chunk(&[5])])
        .run()
        .expect_err("third task");
    assert!(err.is_cancelled(), "err={}", err);

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(!shared.is_ready());
    assert_eq!(
        shared.status(),
        CacheStatus::Cancelled("user cancelled".to_string())
    );
    assert_eq!(shared.stats().num_chunks, 0);
    assert!(shared.read(7).expect_err("unpublished").is_cancelled());
    assert!(fragment.final_status().expect("status").is_cancelled());
}

#[test]
fn test_chunk_cap_fails_fast_and_never_publishes() {
    let options = QueryOptions {
        cache_sink_max_chunks: Some(2),
        cache_sink_max_bytes: Some(0),
        ..QueryOptions::default()
    };
    let (ctx, fragment) = new_fragment("chunk_cap", options);
    let pipeline = cache_pipeline(&fragment, &[7], 1);
    let shared = pipeline.shared_state().expect("shared state");
    let hits = finalize_counter(&shared);

    let err = pipeline
        .driver(vec![int_chunk(&[1]), int_chunk(&[2]), int_chunk(&[3])])
        .run()
        .expect_err("cap exceeded");
    assert!(err.is_mem_limit_exceeded(), "err={}", err);
    assert!(matches!(shared.status(), CacheStatus::Failed(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(!shared.is_ready());
    assert!(shared.read(7).expect_err("failed").is_mem_limit_exceeded());
    assert!(ctx.is_cancelled());
}

#[test]
fn test_byte_cap_rejects_chunk_beyond_cap() {
    let cap_bytes = int_chunk(&[1, 2, 3, 4]).logical_bytes() as u64;
    let options = QueryOptions {
        cache_sink_max_bytes: Some(cap_bytes),
        cache_sink_max_chunks: Some(0),
        ..QueryOptions::default()
    };
    let (_ctx, fragment) = new_fragment("byte_cap", options);
    let pipeline = cache_pipeline(&fragment, &[7], 2);
    let shared = pipeline.shared_state().expect("shared state");
    let results = pipeline.run_parallel(vec![
        vec![int_chunk(&[1, 2, 3, 4])],
        vec![int_chunk(&[5, 6, 7, 8])],
    ]);
    let failures = results.iter().filter(|r| r.is_err()).count();
    assert!(failures >= 1);
    assert!(!shared.is_ready());
    assert!(matches!(shared.status(), CacheStatus::Failed(_)));
}

#[test]
fn test_query_memory_limit_is_enforced() {
    let query_id = unique_query_id("query_mem_limit");
    let ctx = QueryContext::with_mem_limit(query_id, 8);
    let state = RuntimeState::new(
        Arc::clone(&ctx),
        query_id,
        QueryOptions {
            cache_sink_max_bytes: Some(0),
            cache_sink_max_chunks: Some(0),
            ..QueryOptions::default()
        },
    );
    let fragment = Arc::new(FragmentContext::new(Arc::new(state)));
    let pipeline = cache_pipeline(&fragment, &[7], 1);
    let err = pipeline
        .driver(vec![int_chunk(&[1, 2, 3, 4])])
        .run()
        .expect_err("query limit");
    assert!(err.is_mem_limit_exceeded(), "err={}", err);
    assert_eq!(ctx.mem_tracker().current(), 0);
}

#[test]
fn test_empty_chunks_do_not_corrupt_or_finalize() {
    let (_ctx, fragment) = new_fragment("empty_chunks", QueryOptions::default());
    let pipeline = cache_pipeline(&fragment, &[7], 2);
    let shared = pipeline.shared_state().expect("shared state");
    let hits = finalize_counter(&shared);

    pipeline
        .driver(vec![Chunk::default(), int_chunk(&[1]), int_chunk(&[])])
        .run()
        .expect("first task");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(shared.status(), CacheStatus::Building);
    let stats = shared.stats();
    assert_eq!(stats.num_chunks, 1);
    assert_eq!(stats.num_rows, 1);

    pipeline.driver(vec![Chunk::default()]).run().expect("second task");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(sorted_values(&shared, 7), vec![1]);
}

#[test]
fn test_descriptor_init_always_fails() {
    let mut op = CacheSinkOperator::new(SINK_ID, CHILD_ID, [7]);
    let descriptors = vec![
        DataSinkDescriptor::default(),
        DataSinkDescriptor {
            sink_type: "CACHE_SINK".to_string(),
            properties: BTreeMap::from([("dest_id".to_string(), "7".to_string())]),
        },
    ];
    for descriptor in descriptors {
        let err = op.init(&descriptor).expect_err("descriptor init");
        assert!(matches!(err, ExecError::Internal(_)));
        assert!(err.to_string().contains("should not init with descriptor"));
    }
}

#[test]
fn test_wiring_mismatch_is_an_init_error() {
    let state = RuntimeState::default();
    let op = CacheSinkOperator::new(SINK_ID, CHILD_ID, [7, 12]);
    let shared = op.create_shared_state(1);
    let mut local = op.create_local_state(0);
    let err = local
        .init(
            &state,
            LocalSinkStateInfo {
                driver_id: 0,
                child_id: CHILD_ID,
                dest_ids: vec![7],
                shared_state: Arc::downgrade(&shared),
            },
        )
        .expect_err("dest mismatch");
    assert!(matches!(err, ExecError::Init(_)), "err={}", err);
}

#[test]
fn test_sink_after_eos_is_rejected() {
    let state = RuntimeState::default();
    let op = CacheSinkOperator::new(SINK_ID, CHILD_ID, [7]);
    let shared = op.create_shared_state(2);
    let mut local = op.create_local_state(0);
    local
        .init(
            &state,
            LocalSinkStateInfo {
                driver_id: 0,
                child_id: CHILD_ID,
                dest_ids: vec![7],
                shared_state: Arc::downgrade(&shared),
            },
        )
        .expect("init");
    local.open(&state).expect("open");
    op.sink(&state, &mut local, int_chunk(&[1]), true)
        .expect("eos");
    let err = op
        .sink(&state, &mut local, int_chunk(&[2]), true)
        .expect_err("after eos");
    assert!(matches!(err, ExecError::Internal(_)));
    // The rejected eos must not count as a second producer finishing.
    assert_eq!(shared.stats().finished_producers, 1);
    assert!(!shared.is_ready());
}

#[test]
fn test_only_destinations_can_read() {
    let (_ctx, fragment) = new_fragment("destinations_only", QueryOptions::default());
    let pipeline = cache_pipeline(&fragment, &[7, 12], 1);
    let shared = pipeline.shared_state().expect("shared state");
    pipeline
        .driver(vec![int_chunk(&[1, 2])])
        .run()
        .expect("task");

    let state = RuntimeState::clone(fragment.runtime_state());
    let mut foreign = CacheSourceFactory::new(99, Arc::clone(&shared)).create(1, 0);
    assert!(matches!(
        foreign.prepare(&state).expect_err("not a destination"),
        ExecError::Internal(_)
    ));
    assert!(shared.read(99).is_err());

    let mut source = CacheSourceFactory::new(12, Arc::clone(&shared)).create(1, 0);
    source.prepare(&state).expect("prepare");
    assert!(source.precondition_dependency().expect("dep").is_ready());
    let chunk = source.pull_chunk(&state).expect("pull").expect("chunk");
    assert_eq!(int_values(&chunk), vec![1, 2]);
    assert!(source.pull_chunk(&state).expect("pull").is_none());
}

#[test]
fn test_many_concurrent_tasks_finalize_exactly_once() {
    let test_config = TestConfig::default();
    test_config.init_logging();
    let _ = test_config.load_config();

    let (_ctx, fragment) = new_fragment("concurrent_finalize", QueryOptions::default());
    let num_tasks = 8;
    let chunks_per_task = 50;
    let pipeline = cache_pipeline(&fragment, &[7], num_tasks);
    let shared = pipeline.shared_state().expect("shared state");
    let hits = finalize_counter(&shared);

    let inputs: Vec<Vec<Chunk>> = (0..num_tasks)
        .map(|task| {
            (0..chunks_per_task)
                .map(|i| int_chunk(&[(task * chunks_per_task + i) as i32]))
                .collect()
        })
        .collect();
    for result in pipeline.run_parallel(inputs) {
        result.expect("driver");
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let expected: Vec<i32> = (0..(num_tasks * chunks_per_task) as i32).collect();
    assert_eq!(sorted_values(&shared, 7), expected);
    assert_eq!(shared.stats().finished_producers, num_tasks);
}

#[test]
fn test_teardown_releases_cached_memory() {
    let (_ctx, fragment) = new_fragment("teardown", QueryOptions::default());
    let pipeline = cache_pipeline(&fragment, &[7], 1);
    pipeline
        .driver(vec![int_chunk(&[1, 2, 3]), int_chunk(&[4])])
        .run()
        .expect("task");

    let tracker = {
        let shared = pipeline.shared_state().expect("shared state");
        assert!(shared.is_ready());
        shared.mem_tracker().expect("bound tracker")
    };
    assert!(tracker.current() > 0);
    fragment.teardown();
    assert!(pipeline.shared_state().is_none());
    assert_eq!(tracker.current(), 0);
}

#[test]
fn test_fragment_cancel_between_tasks_wakes_consumers() {
    let (_ctx, fragment) = new_fragment("fragment_cancel", QueryOptions::default());
    let pipeline = cache_pipeline(&fragment, &[7], 3);
    let shared = pipeline.shared_state().expect("shared state");
    let (mut source, woken) = parked_source(&shared, 7);

    let results = pipeline.run_parallel(vec![
        vec![int_chunk(&[1]), int_chunk(&[2])],
        vec![int_chunk(&[3])],
    ]);
    for result in results {
        result.expect("driver");
    }
    let tracker = shared.mem_tracker().expect("bound tracker");
    assert!(tracker.current() > 0);
    assert_eq!(woken.load(Ordering::SeqCst), 0);

    assert!(fragment.cancel("user"));
    assert_eq!(shared.status(), CacheStatus::Cancelled("user".to_string()));
    assert!(shared.is_terminal());
    assert!(!shared.is_ready());
    assert_eq!(shared.stats().num_chunks, 0);
    assert_eq!(tracker.current(), 0);

    assert_eq!(woken.load(Ordering::SeqCst), 1);
    assert!(source.has_output());
    let err = source
        .pull_chunk(&RuntimeState::default())
        .expect_err("cancelled cache");
    assert_eq!(err, ExecError::cancelled("user"));
}

#[test]
fn test_failed_cache_wakes_parked_consumer() {
    let options = QueryOptions {
        cache_sink_max_chunks: Some(1),
        cache_sink_max_bytes: Some(0),
        ..QueryOptions::default()
    };
    let (_ctx, fragment) = new_fragment("failed_wakes_consumer", options);
    let pipeline = cache_pipeline(&fragment, &[7], 1);
    let shared = pipeline.shared_state().expect("shared state");
    let (mut source, woken) = parked_source(&shared, 7);

    let err = pipeline
        .driver(vec![int_chunk(&[1]), int_chunk(&[2])])
        .run()
        .expect_err("cap exceeded");
    assert!(err.is_mem_limit_exceeded(), "err={}", err);
    assert_eq!(woken.load(Ordering::SeqCst), 1);
    assert!(source.has_output());
    let err = source
        .pull_chunk(&RuntimeState::default())
        .expect_err("failed cache");
    assert!(err.is_mem_limit_exceeded(), "err={}", err);
}

#[test]
fn test_sibling_failure_cancels_building_cache() {
    let options = QueryOptions {
        cache_sink_max_chunks: Some(2),
        cache_sink_max_bytes: Some(0),
        ..QueryOptions::default()
    };
    let (ctx, fragment) = new_fragment("sibling_failure", options);
    let pipeline = cache_pipeline(&fragment, &[7], 2);
    let shared = pipeline.shared_state().expect("shared state");
    let (_source, woken) = parked_source(&shared, 7);
    pipeline
        .driver(vec![int_chunk(&[1])])
        .run()
        .expect("first task");
    assert_eq!(shared.status(), CacheStatus::Building);

    let sibling = SinkPipeline::new(
        Arc::clone(&fragment),
        Arc::new(CacheSinkOperator::new(SINK_ID + 1, CHILD_ID, [8])),
        1,
    )
    .expect("sibling pipeline");
    let err = sibling
        .driver(vec![int_chunk(&[1]), int_chunk(&[2]), int_chunk(&[3])])
        .run()
        .expect_err("sibling cap");
    assert!(err.is_mem_limit_exceeded(), "err={}", err);

    assert!(ctx.is_cancelled());
    assert!(matches!(
        shared.status(),
        CacheStatus::Cancelled(ref reason) if reason.contains("memory limit exceeded")
    ));
    assert!(matches!(
        sibling.shared_state().expect("sibling state").status(),
        CacheStatus::Failed(_)
    ));
    assert_eq!(woken.load(Ordering::SeqCst), 1);
    assert!(fragment.final_status().expect("status").is_mem_limit_exceeded());
}

#[test]
fn test_pipeline_without_drivers_is_rejected() {
    let (_ctx, fragment) = new_fragment("zero_drivers", QueryOptions::default());
    let op = CacheSinkOperator::new(SINK_ID, CHILD_ID, [7]);
    let err = SinkPipeline::new(Arc::clone(&fragment), Arc::new(op), 0)
        .err()
        .expect("zero drivers");
    assert!(matches!(err, ExecError::Internal(_)), "err={}", err);
    assert!(fragment.shared_states().is_empty());
}
