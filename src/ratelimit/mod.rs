//! Admission-control logic and per-client state management.

mod adaptive;
mod bucket;
mod coordinator;
mod identity;
mod sweeper;
mod window;

pub use adaptive::{Outcome, OutcomeGuard};
pub use coordinator::{BlockedBy, Decision, RateLimitCoordinator};
pub use identity::{ClientKey, ClientKeyExtractor, RequestMeta};
pub use sweeper::{EvictionSweeper, SweeperHandle};
