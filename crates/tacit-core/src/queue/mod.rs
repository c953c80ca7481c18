//! Queue module: named queues, persisted layout, and the virtual value resolver.

pub mod dependency;
pub mod registry;
pub mod storage;
pub mod virtual_registry;

pub use dependency::DependencyGraph;
pub use registry::{QueueRegistry, RestoreReport, SkippedEntry};
pub use storage::{DEFAULT_NAMESPACE, StorageKeys};
pub use virtual_registry::{PendingDependency, Resolution, VirtualRegistry};
