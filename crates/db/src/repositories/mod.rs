//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` (or `&mut PgConnection` for transaction-scoped
//! steps) as the first argument.

pub mod account_repo;
pub mod job_repo;

pub use account_repo::AccountRepo;
pub use job_repo::JobRepo;
