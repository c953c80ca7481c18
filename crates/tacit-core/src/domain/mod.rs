//! Domain model (ids, queued operations, retry policy, virtual values, events).

pub mod errors;
pub mod events;
pub mod ids;
pub mod operation;
pub mod retry;
pub mod virtual_value;

pub use errors::{ErrorCategory, QueueError, RequestError, StoreError};
pub use events::{
    BeforeDispatchEvent, BootEvent, CompleteEvent, CompleteOutcome, ErrorEvent, FailEvent,
    PersistenceErrorEvent, RetryEvent, SuccessEvent,
};
pub use ids::{OperationId, VirtualId};
pub use operation::{
    Behavior, DEFAULT_QUEUE, OperationStatus, Position, QueuedOperation, RequestDescriptor,
    ResultBinding,
};
pub use retry::{Backoff, RetryClassifier, RetryPolicy};
pub use virtual_value::{Dependent, FieldPath, VirtualRef, VirtualValue};
