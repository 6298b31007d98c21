//! Identity provisioning: ensure the desired uid/gid resolve to a real
//! group and user in the host identity database.
//!
//! Provisioning is additive-only. A group or user that already resolves to
//! the requested id is adopted as-is, whatever its name — re-running the
//! bootstrap never creates duplicates and never renames anything. Creation
//! failures are fatal: everything after this phase assumes a valid identity
//! exists.

use std::path::PathBuf;
use std::process::Command;

use nix::unistd::{Gid, Group, Uid, User};
use thiserror::Error;

use super::ProvisionOutcome;

/// Name given to a group created by the bootstrap.
pub const DEFAULT_GROUPNAME: &str = "mcp";
/// Name given to a user created by the bootstrap.
pub const DEFAULT_USERNAME: &str = "mcp";
/// Home directory for a user created by the bootstrap.
pub const DEFAULT_HOME: &str = "/home/mcp";
/// Login shell for a user created by the bootstrap.
const DEFAULT_SHELL: &str = "/bin/bash";

/// The uid/gid pair and corresponding user/group the application runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeIdentity {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub groupname: String,
    pub home: PathBuf,
}

/// Errors from identity provisioning. All of these abort the bootstrap.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The provisioning tool could not be spawned at all.
    #[error("failed to execute {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The provisioning tool ran and reported failure.
    #[error("{tool} failed for {subject}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        subject: String,
        stderr: String,
    },

    /// The identity database could not be queried.
    #[error("cannot query identity database for {subject}: {source}")]
    Lookup {
        subject: String,
        #[source]
        source: nix::Error,
    },

    /// The tool reported success but the entry still does not resolve.
    #[error("{subject} still unresolved after creation")]
    Unresolved { subject: String },
}

/// Ensure a group with the given gid exists, creating one named
/// [`DEFAULT_GROUPNAME`] if necessary. Returns the resolved group name.
pub fn ensure_group(gid: u32) -> Result<(String, ProvisionOutcome), IdentityError> {
    let subject = format!("gid {gid}");

    if let Some(group) = lookup_group(gid, &subject)? {
        tracing::info!(gid, group = %group.name, "group already exists, leaving untouched");
        return Ok((group.name, ProvisionOutcome::SkippedExisting));
    }

    run_tool(
        "groupadd",
        &["-g", &gid.to_string(), DEFAULT_GROUPNAME],
        &subject,
    )?;

    let created = lookup_group(gid, &subject)?
        .ok_or_else(|| IdentityError::Unresolved { subject })?;
    tracing::info!(gid, group = %created.name, "created group");
    Ok((created.name, ProvisionOutcome::Created))
}

/// Ensure a user with the given uid exists, creating one named
/// [`DEFAULT_USERNAME`] in the resolved group if necessary. A pre-existing
/// user is adopted unchanged, including its home directory.
pub fn ensure_user(
    uid: u32,
    gid: u32,
    groupname: &str,
) -> Result<(RuntimeIdentity, ProvisionOutcome), IdentityError> {
    let subject = format!("uid {uid}");

    if let Some(user) = lookup_user(uid, &subject)? {
        tracing::info!(uid, user = %user.name, home = %user.dir.display(), "user already exists, leaving untouched");
        return Ok((
            RuntimeIdentity {
                uid,
                gid,
                username: user.name,
                groupname: groupname.to_string(),
                home: user.dir,
            },
            ProvisionOutcome::SkippedExisting,
        ));
    }

    run_tool(
        "useradd",
        &[
            "-u",
            &uid.to_string(),
            "-g",
            &gid.to_string(),
            "-m",
            "-d",
            DEFAULT_HOME,
            "-s",
            DEFAULT_SHELL,
            DEFAULT_USERNAME,
        ],
        &subject,
    )?;

    let created = lookup_user(uid, &subject)?
        .ok_or_else(|| IdentityError::Unresolved { subject })?;
    tracing::info!(uid, user = %created.name, "created user");
    Ok((
        RuntimeIdentity {
            uid,
            gid,
            username: created.name,
            groupname: groupname.to_string(),
            home: created.dir,
        },
        ProvisionOutcome::Created,
    ))
}

fn lookup_group(gid: u32, subject: &str) -> Result<Option<Group>, IdentityError> {
    Group::from_gid(Gid::from_raw(gid)).map_err(|source| IdentityError::Lookup {
        subject: subject.to_string(),
        source,
    })
}

fn lookup_user(uid: u32, subject: &str) -> Result<Option<User>, IdentityError> {
    User::from_uid(Uid::from_raw(uid)).map_err(|source| IdentityError::Lookup {
        subject: subject.to_string(),
        source,
    })
}

/// Run a system provisioning tool, converting spawn failures and non-zero
/// exits into typed errors.
fn run_tool(tool: &'static str, args: &[&str], subject: &str) -> Result<(), IdentityError> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|source| IdentityError::Spawn { tool, source })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IdentityError::ToolFailed {
            tool,
            subject: subject.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_group_adopts_existing_gid() {
        // The test process's own effective gid always resolves.
        let gid = nix::unistd::getegid().as_raw();
        let (name, outcome) = ensure_group(gid).expect("existing gid should resolve");
        assert_eq!(outcome, ProvisionOutcome::SkippedExisting);
        assert!(!name.is_empty());
    }

    #[test]
    fn ensure_user_adopts_existing_uid() {
        let uid = nix::unistd::geteuid().as_raw();
        let gid = nix::unistd::getegid().as_raw();
        let (identity, outcome) =
            ensure_user(uid, gid, "testgroup").expect("existing uid should resolve");
        assert_eq!(outcome, ProvisionOutcome::SkippedExisting);
        assert_eq!(identity.uid, uid);
        assert_eq!(identity.gid, gid);
        assert_eq!(identity.groupname, "testgroup");
        assert!(!identity.username.is_empty());
        // Home is adopted from the passwd entry, not synthesized.
        assert!(identity.home.is_absolute());
    }

    #[test]
    fn ensure_group_twice_is_a_creation_noop() {
        let gid = nix::unistd::getegid().as_raw();
        let first = ensure_group(gid).unwrap();
        let second = ensure_group(gid).unwrap();
        assert_eq!(first.0, second.0);
        assert_eq!(second.1, ProvisionOutcome::SkippedExisting);
    }

    #[test]
    fn tool_failure_carries_stderr() {
        // `false` ignores arguments and exits 1 with empty stderr; the error
        // must still identify tool and subject.
        let err = run_tool("false", &[], "gid 4242").unwrap_err();
        match err {
            IdentityError::ToolFailed { tool, subject, .. } => {
                assert_eq!(tool, "false");
                assert_eq!(subject, "gid 4242");
            },
            other => panic!("expected ToolFailed, got: {other}"),
        }
    }

    #[test]
    fn missing_tool_is_a_spawn_error() {
        let err = run_tool("definitely-not-a-real-tool", &[], "uid 1").unwrap_err();
        assert!(matches!(err, IdentityError::Spawn { .. }), "got: {err}");
    }
}
