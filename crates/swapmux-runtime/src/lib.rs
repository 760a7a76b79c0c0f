//! Process lifecycle and swap scheduling for swapmux: the Port Allocator,
//! Process Runner, Model Instance state machine, Group Coordinator, Swap
//! Scheduler, Event Bus, and Metrics Store (sections 4.1-4.8).

#![deny(unsafe_code)]

pub mod events;
pub mod group;
pub mod instance;
pub mod metrics;
pub mod ports;
pub mod registry;
pub mod runner;
pub mod scheduler;

pub use events::{BusSubscription, EventBus, DEFAULT_QUEUE_WATERMARK};
pub use group::GroupCoordinator;
pub use instance::{AcquireOutcome, Lease, ModelInstance};
pub use metrics::MetricsStore;
pub use ports::PortAllocator;
pub use registry::{Registry, SharedRegistry};
pub use runner::ProcessRunner;
pub use scheduler::{resolve, Resolution};
