//! Controllers for certificate-carrying Services
//!
//! One reconciler watches Services and answers both the issuance and the
//! renewal trigger. It delegates to the orchestrator and only translates the
//! outcome into a requeue decision.

mod service;

pub use service::{error_policy, reconcile, Context, ContextBuilder};
