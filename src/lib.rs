//! Certificate lifecycle engine for Kubernetes admission webhooks.
//!
//! Admission webhooks are served over TLS, and the API server only delivers
//! requests to them when the `caBundle` installed on the webhook
//! configuration trusts the server certificate. This crate keeps that whole
//! chain alive autonomously: it mints a self-signed CA into an engine-owned
//! secret, issues a TLS secret per backing service, installs the CA bundle
//! into every client-config entry of the managed webhook configurations,
//! rotates all of it ahead of expiry with overlap windows so consumers never
//! observe a trust gap, and cleans superseded material out of the bundles
//! once its overlap has passed.
//!
//! The building blocks layer as follows: [`crypto`] holds the pure signing
//! operations, [`chain`] the in-memory chain and its deterministic
//! rotate/cleanup procedure, [`store`] the mapping between the chain and the
//! stored objects, and [`Manager`] ties them into a reconcile tick that
//! returns when it next wants to run. [`controller::run`] drives that tick
//! from cluster events and the predicted deadline.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use webhook_cert_manager::{controller, Manager, Options, WebhookKind, WebhookReference};
//! use webhook_cert_manager::store::KubeStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let manager = Manager::new(
//!     "my-operator",
//!     "my-namespace",
//!     KubeStore::new(client.clone()),
//!     Options {
//!         ca_rotate_interval: Duration::from_secs(24 * 60 * 60),
//!         ca_overlap_interval: Duration::from_secs(60 * 60),
//!         cert_rotate_interval: Duration::from_secs(8 * 60 * 60),
//!         cert_overlap_interval: Duration::from_secs(30 * 60),
//!     },
//!     vec![WebhookReference {
//!         kind: WebhookKind::Mutating,
//!         name: "my-webhook".to_string(),
//!     }],
//! )?;
//! controller::run(&manager, client).await;
//! # Ok(())
//! # }
//! ```

use std::fmt;

pub mod chain;
pub mod controller;
pub mod crypto;
pub mod manager;
pub mod options;
pub mod store;

pub use manager::Manager;
pub use options::Options;

/// The two kinds of admission webhook configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WebhookKind {
    Mutating,
    Validating,
}

impl fmt::Display for WebhookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WebhookKind::Mutating => "Mutating",
            WebhookKind::Validating => "Validating",
        })
    }
}

/// Selects one webhook configuration for the engine to manage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WebhookReference {
    pub kind: WebhookKind,
    pub name: String,
}

impl fmt::Display for WebhookReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Webhook/{}", self.kind, self.name)
    }
}
