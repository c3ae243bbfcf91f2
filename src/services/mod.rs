pub mod compensation;
pub mod events;
pub mod lock;
pub mod processor;
pub mod recovery;
pub mod validator;

pub use compensation::CompensationService;
pub use events::{EventHandler, EventPublisher, EventRelay, LoggingEventHandler, MAX_RETRY_ATTEMPTS};
pub use lock::{LockConfig, LockGuard, LockManager};
pub use processor::{SubmitRequest, TransactionProcessor, TransactionResult};
pub use recovery::{RecoveryConfig, RecoverySweep, SweepReport};
pub use validator::{LimitConfig, LimitValidator};
