pub mod guard;
pub mod predictor;
pub mod registry;

pub use guard::{BidDecision, BidRequest, BidVeto, GuardSettings, PlatformGuard};
pub use predictor::{HttpPredictor, Predictor, StaticPredictor};
pub use registry::GuardRegistry;
