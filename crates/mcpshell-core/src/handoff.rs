//! Privilege drop and process replacement.
//!
//! The final bootstrap step replaces this process with the operator's
//! command, running as the reconciled runtime identity. The drop order is
//! fixed: supplementary groups, then gid, then uid. Dropping uid first
//! would leave the process unable to change its gid.

use std::convert::Infallible;
use std::env;
use std::ffi::CString;

use nix::unistd::{self, Gid, Uid};
use thiserror::Error;

use crate::bootstrap::identity::RuntimeIdentity;

/// Errors from the exec handoff. Any of these leaves the bootstrap process
/// alive and is reported as a failed boot.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// No command was supplied to hand off to.
    #[error("no command to execute after bootstrap")]
    EmptyCommand,

    /// An argument contained an interior NUL byte.
    #[error("command argument contains a NUL byte: {arg:?}")]
    BadArgument { arg: String },

    /// One of the privilege-drop syscalls failed.
    #[error("cannot drop privileges ({op} to {id}): {source}")]
    PrivilegeDrop {
        op: &'static str,
        id: u32,
        #[source]
        source: nix::Error,
    },

    /// `execvp` returned, meaning the command could not be started.
    #[error("cannot execute {command:?}: {source}")]
    Exec {
        command: String,
        #[source]
        source: nix::Error,
    },
}

/// Seam between the bootstrap orchestration and the irreversible exec.
///
/// Production uses [`ExecHandoff`]; tests substitute a recorder so the
/// full bootstrap sequence can run without replacing the test process.
pub trait ProcessHandoff {
    /// Drop to `identity` and replace the current process with `argv`.
    ///
    /// On success this never returns, hence the [`Infallible`] Ok type.
    fn exec_as(
        &self,
        identity: &RuntimeIdentity,
        argv: &[String],
    ) -> Result<Infallible, HandoffError>;
}

/// The real handoff: setgroups/setgid/setuid followed by `execvp`.
#[derive(Debug, Default)]
pub struct ExecHandoff;

impl ProcessHandoff for ExecHandoff {
    fn exec_as(
        &self,
        identity: &RuntimeIdentity,
        argv: &[String],
    ) -> Result<Infallible, HandoffError> {
        if argv.is_empty() {
            return Err(HandoffError::EmptyCommand);
        }

        let uid = Uid::from_raw(identity.uid);
        let gid = Gid::from_raw(identity.gid);

        // Already at the target identity (container started unprivileged,
        // or the operator asked for uid 0): nothing to drop, and the
        // setgroups call would fail without CAP_SETGID anyway.
        if unistd::geteuid() == uid && unistd::getegid() == gid {
            tracing::debug!(uid = identity.uid, gid = identity.gid, "already at target identity");
        } else {
            unistd::setgroups(&[gid]).map_err(|source| HandoffError::PrivilegeDrop {
                op: "setgroups",
                id: identity.gid,
                source,
            })?;
            unistd::setgid(gid).map_err(|source| HandoffError::PrivilegeDrop {
                op: "setgid",
                id: identity.gid,
                source,
            })?;
            unistd::setuid(uid).map_err(|source| HandoffError::PrivilegeDrop {
                op: "setuid",
                id: identity.uid,
                source,
            })?;
        }

        env::set_var("HOME", &identity.home);
        env::set_var("USER", &identity.username);
        env::set_var("LOGNAME", &identity.username);

        let cargs = argv
            .iter()
            .map(|arg| {
                CString::new(arg.as_bytes()).map_err(|_| HandoffError::BadArgument {
                    arg: arg.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            uid = identity.uid,
            gid = identity.gid,
            command = %argv.join(" "),
            "handing off"
        );
        match unistd::execvp(&cargs[0], &cargs) {
            Ok(never) => match never {},
            Err(source) => Err(HandoffError::Exec {
                command: argv[0].clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> RuntimeIdentity {
        RuntimeIdentity {
            uid: unistd::geteuid().as_raw(),
            gid: unistd::getegid().as_raw(),
            username: "test".to_string(),
            groupname: "test".to_string(),
            home: "/tmp".into(),
        }
    }

    #[test]
    fn empty_argv_is_rejected_before_any_syscall() {
        let err = ExecHandoff.exec_as(&identity(), &[]).unwrap_err();
        assert!(matches!(err, HandoffError::EmptyCommand));
    }

    #[test]
    fn interior_nul_in_argument_is_rejected() {
        let argv = vec!["echo".to_string(), "bad\0arg".to_string()];
        let err = ExecHandoff.exec_as(&identity(), &argv).unwrap_err();
        assert!(matches!(err, HandoffError::BadArgument { .. }), "got: {err}");
    }

    #[test]
    fn missing_binary_reports_exec_failure() {
        // Current identity matches the target, so no drop is attempted and
        // the failure comes from execvp itself.
        let argv = vec!["/nonexistent/mcpshell-test-binary".to_string()];
        let err = ExecHandoff.exec_as(&identity(), &argv).unwrap_err();
        match err {
            HandoffError::Exec { command, .. } => {
                assert_eq!(command, "/nonexistent/mcpshell-test-binary");
            },
            other => panic!("expected Exec error, got: {other}"),
        }
    }
}
