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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<PipeCacheConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static PipeCacheConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = PipeCacheConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config not initialized"))
}

pub fn init_from_env_or_default() -> Result<&'static PipeCacheConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = PipeCacheConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config not initialized"))
}

pub fn config() -> Result<&'static PipeCacheConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("PIPECACHE_CONFIG")
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    let candidates = [PathBuf::from("pipecache.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $PIPECACHE_CONFIG or create ./pipecache.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct PipeCacheConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "pipecache=debug,pipecache::exec=trace"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl PipeCacheConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: PipeCacheConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> &str {
        self.log_filter
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or(&self.log_level)
    }
}

impl Default for PipeCacheConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads used to run sink drivers. 0 means one per CPU core.
    #[serde(default)]
    pub pipeline_exec_thread_pool_thread_num: usize,
    /// Process-wide memory limit in bytes for query trackers. 0 disables the limit.
    #[serde(default)]
    pub query_mem_limit_bytes: u64,
    #[serde(default)]
    pub cache_sink: CacheSinkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pipeline_exec_thread_pool_thread_num: 0,
            query_mem_limit_bytes: 0,
            cache_sink: CacheSinkConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Get the actual number of exec threads.
    /// Returns CPU cores if configured as 0.
    pub fn actual_exec_threads(&self) -> usize {
        if self.pipeline_exec_thread_pool_thread_num > 0 {
            self.pipeline_exec_thread_pool_thread_num
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CacheSinkConfig {
    /// Byte cap for one shared cache. 0 means unlimited.
    #[serde(default = "default_cache_sink_max_bytes")]
    pub max_bytes: u64,
    /// Chunk count cap for one shared cache. 0 means unlimited.
    #[serde(default)]
    pub max_chunks: usize,
}

fn default_cache_sink_max_bytes() -> u64 {
    1_073_741_824
}

impl Default for CacheSinkConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_cache_sink_max_bytes(),
            max_chunks: 0,
        }
    }
}
