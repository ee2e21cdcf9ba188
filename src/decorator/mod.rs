//! Failure-recovery decorators
//!
//! Each decorator wraps exactly one child task — composition, not
//! inheritance — and re-derives its own outcome from the child's events:
//! [`Retry`] re-runs an erroring child within a budget, [`Timeout`]
//! enforces a wall-clock deadline, and [`Failsafe`] turns child errors
//! into successful completions. None of them leaks the child's failure
//! past its own boundary.

pub mod failsafe;
pub mod retry;
pub mod timeout;

pub use failsafe::Failsafe;
pub use retry::Retry;
pub use timeout::Timeout;
