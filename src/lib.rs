//! cert-injector - ACME HTTP-01 certificates for Kubernetes Services
//!
//! A Service annotated with `cert.injector.ko/inject: "true"` gets a
//! certificate for the domains it lists. The controller answers the HTTP-01
//! challenge by briefly retargeting the Service at a resolver pod, stores the
//! result as `<service>-tls`, and flags the backing Deployment. A mutating
//! admission webhook then mounts that secret into the Deployment's pods.
//!
//! # Architecture
//!
//! State lives in annotations on the user's own objects; there is no custom
//! resource. Three process roles share this crate:
//! - `controller` runs the issue and renew reconcilers over Services
//! - `injector` serves the admission webhook over TLS
//! - `resolver` answers a single HTTP-01 challenge inside the transient pod
//!
//! # Modules
//!
//! - [`annotations`] - Annotation keys and typed readers
//! - [`kube_client`] - Kubernetes API boundary
//! - [`acme`] - ACME collaborator boundary and the instant-acme client
//! - [`challenge`] - Challenge provider contract, router and resolver endpoint
//! - [`issuer`] - Certificate orchestration state machine
//! - [`materializer`] - TLS secret writes and Deployment flagging
//! - [`webhook`] - Admission mutation engine
//! - [`controller`] - Issue and renew reconcilers
//! - [`pki`] - CSR generation and certificate inspection
//! - [`retry`] - Bounded polling with backoff
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod acme;
pub mod annotations;
pub mod challenge;
pub mod controller;
pub mod error;
pub mod issuer;
pub mod kube_client;
pub mod materializer;
pub mod pki;
pub mod retry;
pub mod webhook;

use std::time::Duration;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default port for the challenge resolver HTTP server
pub const DEFAULT_RESOLVER_PORT: u16 = 8080;

/// Default port for the admission webhook HTTPS server
///
/// 8443 rather than 443 so the injector does not need root.
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

/// Default wait after retargeting a Service before validation is requested
pub const DEFAULT_PROPAGATION_WAIT: Duration = Duration::from_secs(45);

/// Default wait before an order is placed
pub const DEFAULT_PRE_OBTAIN_WAIT: Duration = Duration::from_secs(45);

/// Redelivery delay after the CA throttled us (one week)
pub const RATE_LIMIT_REQUEUE: Duration = Duration::from_secs(168 * 3600);

/// Delay until the next renewal pass after a successful renewal
pub const RENEWAL_INTERVAL: Duration = Duration::from_secs(850 * 3600);

/// A certificate is renewed once less than this much validity remains
pub const RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 3600);
