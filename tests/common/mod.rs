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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use tempfile::TempDir;

use pipecache::common::types::UniqueId;
use pipecache::exec::chunk::Chunk;
use pipecache::exec::pipeline::fragment_context::FragmentContext;
use pipecache::runtime::query_context::QueryContext;
use pipecache::runtime::runtime_state::{QueryOptions, RuntimeState};
use pipecache::{pipecache_config, pipecache_logging};

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_pipecache.toml");

        let config_content = r#"
log_level = "debug"

[runtime]
pipeline_exec_thread_pool_thread_num = 4
query_mem_limit_bytes = 0

[runtime.cache_sink]
max_bytes = 0
max_chunks = 0
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        pipecache_logging::init_with_level("debug");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<&'static pipecache_config::PipeCacheConfig> {
        pipecache_config::init_from_path(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Generate a unique query ID based on test name.
pub fn unique_query_id(test_name: &str) -> UniqueId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    test_name.hash(&mut hasher);
    let hash = hasher.finish();

    UniqueId {
        hi: hash as i64,
        lo: (hash >> 32) as i64,
    }
}

/// Fragment with its own query context, unlimited query memory.
pub fn new_fragment(test_name: &str, options: QueryOptions) -> (Arc<QueryContext>, Arc<FragmentContext>) {
    let query_id = unique_query_id(test_name);
    let ctx = QueryContext::with_mem_limit(query_id, -1);
    let state = RuntimeState::new(
        Arc::clone(&ctx),
        UniqueId::new(query_id.hi, query_id.lo.wrapping_add(1)),
        options,
    );
    (ctx, Arc::new(FragmentContext::new(Arc::new(state))))
}

/// Single Int32 column chunk named `v`.
pub fn int_chunk(values: &[i32]) -> Chunk {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
    let array = Arc::new(Int32Array::from(values.to_vec())) as ArrayRef;
    let batch = RecordBatch::try_new(schema, vec![array]).expect("record batch");
    Chunk::new(batch)
}

pub fn int_values(chunk: &Chunk) -> Vec<i32> {
    chunk.columns()[0]
        .as_any()
        .downcast_ref::<Int32Array>()
        .expect("int32 column")
        .values()
        .to_vec()
}
