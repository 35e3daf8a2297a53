//! relayctl-core — idempotent provisioning for a private IPFS relay.
//!
//! Models install/remove/diagnose of a Kubo relay node fronted by an nginx
//! reverse proxy (TLS + basic auth) as state reconciliation: snapshot the
//! machine ([`observe`]), diff it against a declared target ([`target`],
//! [`plan`]), and apply the minimal ordered set of idempotent steps
//! ([`apply`], [`teardown`]). Heavy machinery — TLS, proxying, the P2P
//! daemon, bcrypt — stays delegated to the wrapped system tools.
//!
//! The planner is a pure function, and every side effect flows through
//! the [`exec::CommandRunner`] and [`artifact::ArtifactSource`] seams, so
//! the whole reconciliation policy is testable against fakes.

pub mod apply;
pub mod artifact;
pub mod config;
pub mod diagnose;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod gate;
pub mod lock;
pub mod observe;
pub mod plan;
pub mod proxy;
pub mod reconciler;
pub mod secrets;
pub mod service;
pub mod target;
pub mod teardown;

pub use error::{ErrorKind, ReconcileError, Residue};
pub use reconciler::{converge, diverge, preview, ConvergeSummary};
