//! Dispatch engine: lease work, deliver it, settle the outcome.

pub mod backoff;
pub mod dispatch;

pub use backoff::Backoff;
pub use dispatch::{DispatchConfig, DispatchLoop, DispatchSummary, LoopState};
