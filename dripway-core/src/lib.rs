// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Core building blocks for the dripway request-shaping gateway: the job
//! data model, the tool registry, retry policies and the durable job store.

pub mod job;
pub mod registry;
pub mod resilience;
pub mod store;

pub use job::{
    BatchProgress, Job, JobStatus, QueueStats, ResultRecord, PRIORITY_DEFAULT, PRIORITY_HIGHEST,
    PRIORITY_LOWEST,
};
pub use registry::{ParamCheck, ToolEntry, ToolRegistry};
pub use resilience::{job_retry_delay, RetryPolicy};
pub use store::{ClaimedJob, JobStore, MemoryStore, RedisStore, RetentionPolicy, StoreError};
