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
use crate::pipecache_config::config as pipecache_app_config;

pub(crate) fn pipeline_exec_thread_pool_thread_num() -> usize {
    pipecache_app_config()
        .ok()
        .map(|c| c.runtime.actual_exec_threads())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn query_mem_limit_bytes() -> Option<u64> {
    pipecache_app_config()
        .ok()
        .map(|c| c.runtime.query_mem_limit_bytes)
        .filter(|v| *v > 0)
}

pub(crate) fn cache_sink_max_bytes() -> u64 {
    pipecache_app_config()
        .ok()
        .map(|c| c.runtime.cache_sink.max_bytes)
        .unwrap_or(1_073_741_824)
}

pub(crate) fn cache_sink_max_chunks() -> usize {
    pipecache_app_config()
        .ok()
        .map(|c| c.runtime.cache_sink.max_chunks)
        .unwrap_or(0)
}
