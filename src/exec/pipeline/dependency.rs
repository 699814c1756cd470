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
//! Named readiness flags that consumers can wait on.
//!
//! A dependency flips from blocked to ready once; waiters registered before or
//! after the flip are called exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::exec::pipeline::schedule::observer::{Observable, Observer};
use crate::pipecache_logging::debug;

static NEXT_DEP_ID: AtomicUsize = AtomicUsize::new(1);

pub type DependencyHandle = Arc<Dependency>;

pub struct Dependency {
    id: usize,
    name: String,
    ready: AtomicBool,
    observable: Arc<Observable>,
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Dependency {}

impl Dependency {
    pub fn new(name: impl Into<String>) -> DependencyHandle {
        Arc::new(Self {
            id: NEXT_DEP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ready: AtomicBool::new(false),
            observable: Arc::new(Observable::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Returns `true` only for the call that performed the blocked -> ready flip.
    pub fn set_ready(&self) -> bool {
        let prev = self.ready.swap(true, Ordering::AcqRel);
        if prev {
            return false;
        }
        debug!(
            "Dependency ready: dep_id={} name={} observers={}",
            self.id,
            self.name,
            self.observable.num_observers()
        );
        let notify = self.observable.defer_notify();
        notify.arm();
        true
    }

    pub fn add_waiter(&self, observer: Observer) {
        if self.is_ready() {
            observer();
            return;
        }
        // A flip between the check above and the registration below must still reach
        // this waiter, so it is wrapped to fire at most once.
        let fired = Arc::new(AtomicBool::new(false));
        let once: Observer = {
            let fired = Arc::clone(&fired);
            Arc::new(move || {
                if !fired.swap(true, Ordering::AcqRel) {
                    observer();
                }
            })
        };
        self.observable.add_observer(Arc::clone(&once));
        if self.is_ready() {
            once();
        }
    }
}
