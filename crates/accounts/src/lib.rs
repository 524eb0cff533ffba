//! Account pool: credential lifecycle and slot/quota accounting.
//!
//! Built on the durable store; uses the protocol client only for the
//! lightweight authentication probe during onboarding. Selection is
//! race-free: the slot reservation happens in the same transaction as
//! the read.

pub mod key;
pub mod pool;

pub use pool::{
    AccountPool, AddAccountError, ExhaustionReason, PickAccountError, PoolLimits,
    CONCURRENCY_LIMIT, DAILY_LIMIT,
};
