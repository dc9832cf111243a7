// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Quotagate shared types
//!
//! Plan tiers, the per-identity user record, and database bootstrap helpers used by
//! every crate in the workspace.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{PlanTier, UnknownPlanTier, UserRecord};
