//! mcpshell-core — startup bootstrap for the mcpshell application container.
//!
//! Everything that has to happen before the real application process starts
//! lives here: reconciling the container's runtime identity (UID/GID) with
//! the host, provisioning a writable project workspace, materializing SSH
//! private keys from base64-encoded environment variables, and finally
//! dropping privileges and replacing the process image with the target
//! command.
//!
//! # Design
//!
//! - **Idempotent**: re-running the bootstrap with the same environment is
//!   safe. Existing identities, key files, and workspace content are never
//!   replaced or re-owned.
//! - **Fail-closed**: identity creation, credentials-directory setup, and
//!   key decoding failures abort before the application is ever started.
//! - **Explicit configuration**: the environment is read once into a
//!   [`config::BootstrapConfig`]; every provisioning step takes the resolved
//!   values as arguments so it can be exercised against a temp directory.
//! - **Injectable handoff**: the final exec is behind the
//!   [`handoff::ProcessHandoff`] trait so the phase sequencing is testable
//!   without replacing the test process.

pub mod bootstrap;
pub mod config;
pub mod handoff;

pub use bootstrap::{
    plan_bootstrap, run_bootstrap, run_phases, BootstrapAction, BootstrapError, BootstrapReceipt,
    ProvisionOutcome,
};
pub use bootstrap::identity::RuntimeIdentity;
pub use bootstrap::keys::MaterializeOutcome;
pub use config::{BootstrapConfig, ConfigError, KeySlot, SlotMaterial, KEY_SLOTS};
pub use handoff::{ExecHandoff, HandoffError, ProcessHandoff};
