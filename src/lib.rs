//! Tiered buffering queue for telemetry point batches.
//!
//! Producers hand batches of point lines to a [`TierChain`]; the first tier
//! with room stores them, usually a memory tier overflowing into a disk tier.
//! Drain workers pull batches back out one partition at a time through the
//! transactional consume protocol in [`consume`].

pub mod chain;
pub mod config;
pub mod consume;
pub mod core;
pub mod error;
pub mod metrics;
pub mod session;
pub mod store;
pub mod throttle;
pub mod tier;

pub use chain::TierChain;
pub use config::{BufferConfig, DiskTierConfig, DrainConfig, FailurePolicy, MemoryTierConfig};
pub use consume::{AdmissionControl, BatchSink, DrainReport, DrainTarget, DrainWorker, Unlimited};
pub use error::{Error, Result};
pub use metrics::{MetricSample, MetricsBridge, QueueStats, StatsRegistry};
pub use store::{
    CapacityPolicy, DiskStore, MemoryStore, PartitionedQueueStore, Record, RejectPolicy,
    SpillPolicy,
};
pub use tier::{QueueDescriptor, Tier, TierKind, TierState};
