pub mod account;
pub mod event;
pub mod transaction;

pub use account::{Account, AccountStatus, LimitOverride};
pub use event::{EventType, TransactionEvent};
pub use transaction::{DomainError, Transaction, TransactionKind, TransactionStatus};
