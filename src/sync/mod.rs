pub mod coordinator;
pub mod events;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod types;

pub use coordinator::{SyncCoordinator, SyncCoordinatorOptions};
pub use events::{EventBus, SubscriptionId};
pub use queue::SyncQueue;
pub use scheduler::SyncScheduler;
pub use state::{Connectivity, ConnectivityState, Signal, Transition};
pub use types::{
    ApplyOutcome, DeadLetter, DrainReport, QueueAction, QueueEntry, RetryPolicy, SyncEvent,
    WriteOutcome,
};
