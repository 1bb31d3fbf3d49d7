pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::AppConfig;
pub use error::{FailureKind, GuardError, GuardResult, Retryable, TransportError};
pub use types::{DecisionSource, Platform};
