//! # gogh-optim
//!
//! The optimizer behind gogh's stylization loop: limited-memory BFGS with
//! a backtracking line search, driving a single parameter tensor through a
//! re-entrant loss/gradient closure.

pub mod lbfgs;

pub use lbfgs::{Evaluation, Lbfgs, LbfgsConfig};
