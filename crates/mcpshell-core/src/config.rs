//! Bootstrap configuration resolved from the container environment.
//!
//! The environment is read exactly once, at startup, into a
//! [`BootstrapConfig`]. All provisioning functions take resolved values from
//! this struct instead of reaching into `std::env` themselves.
//!
//! # Environment Variables
//!
//! - `UID`, `GID` — numeric runtime identity, default 1000/1000. Values that
//!   do not parse as integers are rejected (fail-closed) rather than
//!   silently defaulted.
//! - `WORKDIR` — workspace root path, default `<home>/workspace` (resolved
//!   against the provisioned user's home directory).
//! - `SSH_PRIVATE_KEY_{RSA,ECDSA,ED25519}_B64` — base64-encoded PEM private
//!   key bytes, one per key slot.

use std::path::PathBuf;

use thiserror::Error;

/// Identity used when `UID`/`GID` are unset.
pub const DEFAULT_UID: u32 = 1000;
/// See [`DEFAULT_UID`].
pub const DEFAULT_GID: u32 = 1000;

/// Directory name appended to the user's home when `WORKDIR` is unset.
pub const DEFAULT_WORKDIR_NAME: &str = "workspace";

/// One type of SSH private key the bootstrap may materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySlot {
    /// Environment variable carrying the base64-encoded key bytes.
    pub env_var: &'static str,
    /// Target filename under `<home>/.ssh/`.
    pub file_name: &'static str,
    /// Human-readable label for diagnostics.
    pub label: &'static str,
}

/// The fixed, ordered set of supported key slots.
pub const KEY_SLOTS: &[KeySlot] = &[
    KeySlot {
        env_var: "SSH_PRIVATE_KEY_RSA_B64",
        file_name: "id_rsa",
        label: "RSA",
    },
    KeySlot {
        env_var: "SSH_PRIVATE_KEY_ECDSA_B64",
        file_name: "id_ecdsa",
        label: "ECDSA",
    },
    KeySlot {
        env_var: "SSH_PRIVATE_KEY_ED25519_B64",
        file_name: "id_ed25519",
        label: "ED25519",
    },
];

/// A key slot together with the value its environment variable held at
/// startup. `None` means unset or empty (the slot is skipped).
#[derive(Debug, Clone)]
pub struct SlotMaterial {
    pub slot: &'static KeySlot,
    pub value: Option<String>,
}

/// Errors from reading the bootstrap environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An id variable held something other than an unsigned integer.
    #[error("environment variable {var} must be an unsigned integer, got {value:?}")]
    InvalidId { var: &'static str, value: String },

    /// An environment variable held non-UTF-8 bytes (fail-closed).
    #[error("environment variable {var} is not valid UTF-8")]
    NotUnicode { var: &'static str },
}

/// Resolved bootstrap configuration.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Desired runtime uid.
    pub uid: u32,
    /// Desired runtime gid.
    pub gid: u32,
    /// Workspace root override from `WORKDIR`; `None` selects
    /// `<home>/workspace` once the identity's home is known.
    pub workdir: Option<PathBuf>,
    /// Overrides the home directory reported by the identity database.
    /// Not reachable from the environment; exists so tests can point the
    /// credentials directory at a temp path.
    pub home_override: Option<PathBuf>,
    /// Key material captured from the environment, one entry per slot in
    /// [`KEY_SLOTS`] order.
    pub slots: Vec<SlotMaterial>,
}

impl BootstrapConfig {
    /// Read the bootstrap configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `UID` or `GID` does not parse as an
    /// unsigned integer, or any inspected variable is not valid UTF-8.
    pub fn from_env() -> Result<Self, ConfigError> {
        let uid = resolve_id("UID", env_value("UID")?, DEFAULT_UID)?;
        let gid = resolve_id("GID", env_value("GID")?, DEFAULT_GID)?;
        let workdir = env_value("WORKDIR")?.map(PathBuf::from);

        let mut slots = Vec::with_capacity(KEY_SLOTS.len());
        for slot in KEY_SLOTS {
            slots.push(SlotMaterial {
                slot,
                value: env_value(slot.env_var)?,
            });
        }

        Ok(Self {
            uid,
            gid,
            workdir,
            home_override: None,
            slots,
        })
    }
}

/// Read one environment variable, treating unset and empty/whitespace-only
/// values identically as absent.
fn env_value(var: &'static str) -> Result<Option<String>, ConfigError> {
    match std::env::var(var) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode { var }),
    }
}

/// Parse an id variable, defaulting when absent.
fn resolve_id(var: &'static str, raw: Option<String>, default: u32) -> Result<u32, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    raw.trim()
        .parse::<u32>()
        .map_err(|_| ConfigError::InvalidId { var, value: raw })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_id_defaults_when_absent() {
        assert_eq!(resolve_id("UID", None, DEFAULT_UID).unwrap(), DEFAULT_UID);
        assert_eq!(resolve_id("GID", None, DEFAULT_GID).unwrap(), DEFAULT_GID);
    }

    #[test]
    fn resolve_id_parses_and_trims() {
        assert_eq!(
            resolve_id("UID", Some("2000".to_string()), DEFAULT_UID).unwrap(),
            2000
        );
        assert_eq!(
            resolve_id("GID", Some(" 42 \n".to_string()), DEFAULT_GID).unwrap(),
            42
        );
    }

    #[test]
    fn resolve_id_rejects_garbage() {
        let err = resolve_id("UID", Some("abc".to_string()), DEFAULT_UID).unwrap_err();
        assert!(
            err.to_string().contains("unsigned integer"),
            "should name the expectation: {err}"
        );
        assert!(resolve_id("GID", Some("-1".to_string()), DEFAULT_GID).is_err());
        assert!(resolve_id("UID", Some("10.5".to_string()), DEFAULT_UID).is_err());
    }

    #[test]
    fn key_slots_cover_all_supported_types_in_order() {
        let names: Vec<_> = KEY_SLOTS.iter().map(|s| s.file_name).collect();
        assert_eq!(names, vec!["id_rsa", "id_ecdsa", "id_ed25519"]);
        for slot in KEY_SLOTS {
            assert!(slot.env_var.starts_with("SSH_PRIVATE_KEY_"));
            assert!(slot.env_var.ends_with("_B64"));
        }
    }
}
