// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries owned context strings
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Quotagate Billing Module
//!
//! The subscription and usage reconciliation core: binds a messaging identity to a plan
//! tier and a Free-tier quota, and keeps that state consistent across chat messages,
//! Stripe webhooks and the monthly reset.
//!
//! ## Features
//!
//! - **Usage Gate**: Free-tier quota check and consumption
//! - **Plan Resolver**: Stripe price to tier mapping with a monthly fallback
//! - **Reconciliation Engine**: One state transition per inbound event, applied through
//!   compare-and-swap writes that enforce record invariants
//! - **Checkout Reconciliation**: Keeps only the newest active subscription per customer
//! - **Usage Reset**: Monthly Free-quota reset, claimed once per period
//! - **Webhooks**: Stripe signature verification and event translation
//! - **Invariant Sweeps**: Read-only SQL consistency checks

pub mod answers;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod invariants;
pub mod locks;
pub mod mock;
pub mod payments;
pub mod plans;
pub mod reset;
pub mod store;
pub mod usage;
pub mod webhooks;


// Collaborators
pub use answers::{Answer, AnswerBackend, AnswerError, ProfileSource};
pub use payments::{PaymentProvider, SubscriptionStatus, SubscriptionSummary};

// Client
pub use client::{StripeClient, StripeConfig, IDENTITY_METADATA_KEY};

// Config
pub use config::{BillingConfig, ResetSchedule};

// Engine
pub use engine::{ReconciliationEngine, RedirectDecision};
pub use events::{
    ApologyReason, BillingEvent, Disposition, DropReason, MenuCommand, Outcome, Reply,
};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Plans and usage
pub use plans::{PlanResolver, PriceIds};
pub use usage::{GateDecision, UsageGate};

// Reset
pub use reset::{ResetOutcome, UsageReset};

// Store
pub use store::{InMemoryUserStore, PgUserStore, UpdateOutcome, UserPatch, UserStore};

// Webhooks
pub use webhooks::{StripeWebhookAdapter, VerifiedEvent};
