//! Bootstrap phase sequencing.
//!
//! The phases run in a fixed order — group, user, workspace, credentials
//! directory, key slots — because each one consumes what the previous one
//! established. Every phase records a [`BootstrapAction`] in the receipt,
//! including the ones that found nothing to do, so a re-run produces an
//! auditable trail of what was skipped and why.

use std::convert::Infallible;
use std::fs;
use std::os::unix::fs::MetadataExt;

use serde::Serialize;
use thiserror::Error;

use crate::config::{BootstrapConfig, DEFAULT_WORKDIR_NAME};
use crate::handoff::{HandoffError, ProcessHandoff};

pub mod identity;
pub mod keys;
pub mod workspace;

use identity::{IdentityError, RuntimeIdentity, DEFAULT_GROUPNAME, DEFAULT_HOME, DEFAULT_USERNAME};
use keys::{KeyError, MaterializeOutcome, SSH_DIR_NAME};
use workspace::{WorkspaceError, DEFAULT_PROJECT_DIR};

/// Schema identifier stamped into every serialized receipt.
pub const RECEIPT_SCHEMA: &str = "mcpshell.bootstrap_receipt.v1";

/// Result of one idempotent provisioning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The step created something.
    Created,
    /// The target already existed and was left untouched.
    SkippedExisting,
}

/// One recorded bootstrap step.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapAction {
    /// Stable machine-readable step name.
    pub kind: &'static str,
    /// Human-readable account of what happened (or would happen).
    pub description: String,
    /// True when the step found its work already done.
    pub skipped: bool,
}

/// Full account of a bootstrap run, serializable for `--json` output.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReceipt {
    pub schema: &'static str,
    pub dry_run: bool,
    pub uid: u32,
    pub gid: u32,
    pub actions: Vec<BootstrapAction>,
}

/// Errors from any bootstrap phase.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

/// Run every provisioning phase, leaving the process untouched.
///
/// Returns the receipt together with the reconciled identity so the caller
/// can hand off to it.
pub fn run_phases(
    config: &BootstrapConfig,
) -> Result<(BootstrapReceipt, RuntimeIdentity), BootstrapError> {
    let mut actions = Vec::new();

    let (groupname, group_outcome) = identity::ensure_group(config.gid)?;
    actions.push(provision_action(
        "group",
        group_outcome,
        format!("group {groupname} (gid {})", config.gid),
    ));

    let (mut ident, user_outcome) = identity::ensure_user(config.uid, config.gid, &groupname)?;
    actions.push(provision_action(
        "user",
        user_outcome,
        format!(
            "user {} (uid {}) with home {}",
            ident.username,
            config.uid,
            ident.home.display()
        ),
    ));
    if let Some(home) = &config.home_override {
        ident.home = home.clone();
    }

    let workdir = config
        .workdir
        .clone()
        .unwrap_or_else(|| ident.home.join(DEFAULT_WORKDIR_NAME));
    let workspace_outcome = workspace::provision_workspace(&workdir, &ident)?;
    actions.push(provision_action(
        "workspace",
        workspace_outcome,
        format!(
            "workspace {} with {DEFAULT_PROJECT_DIR}/ subdirectory",
            workdir.display()
        ),
    ));

    let (ssh_dir, ssh_outcome) = keys::ensure_ssh_dir(&ident.home, &ident)?;
    actions.push(provision_action(
        "ssh-dir",
        ssh_outcome,
        format!("credentials directory {} (mode 0700)", ssh_dir.display()),
    ));

    for material in &config.slots {
        let outcome =
            keys::materialize_slot(&ssh_dir, material.slot, material.value.as_deref(), &ident)?;
        let target = ssh_dir.join(material.slot.file_name);
        let (skipped, description) = match outcome {
            MaterializeOutcome::Created => {
                (false, format!("{} key at {}", material.slot.label, target.display()))
            },
            MaterializeOutcome::SkippedExisting => (
                true,
                format!("{} key at {} (already present)", material.slot.label, target.display()),
            ),
            MaterializeOutcome::SkippedUnset => (
                true,
                format!("{} key ({} unset)", material.slot.label, material.slot.env_var),
            ),
        };
        actions.push(BootstrapAction {
            kind: "ssh-key",
            description,
            skipped,
        });
    }

    let receipt = BootstrapReceipt {
        schema: RECEIPT_SCHEMA,
        dry_run: false,
        uid: config.uid,
        gid: config.gid,
        actions,
    };
    Ok((receipt, ident))
}

/// Run the full bootstrap and replace the process with `argv`.
///
/// The command is validated before any phase runs, so a missing command
/// never leaves the system half-provisioned by an invocation that could
/// not have succeeded anyway.
pub fn run_bootstrap<H: ProcessHandoff + ?Sized>(
    config: &BootstrapConfig,
    argv: &[String],
    handoff: &H,
) -> Result<Infallible, BootstrapError> {
    if argv.is_empty() {
        return Err(HandoffError::EmptyCommand.into());
    }
    let (receipt, ident) = run_phases(config)?;
    let performed = receipt.actions.iter().filter(|a| !a.skipped).count();
    tracing::info!(
        uid = ident.uid,
        gid = ident.gid,
        performed,
        skipped = receipt.actions.len() - performed,
        "bootstrap complete"
    );
    let never = handoff.exec_as(&ident, argv)?;
    match never {}
}

/// Inspect the current state and report what a real run would do, without
/// mutating anything.
pub fn plan_bootstrap(config: &BootstrapConfig) -> Result<BootstrapReceipt, BootstrapError> {
    let mut actions = Vec::new();

    let group = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(config.gid)).map_err(
        |source| IdentityError::Lookup {
            subject: format!("gid {}", config.gid),
            source,
        },
    )?;
    actions.push(plan_action(
        "group",
        group.is_some(),
        match &group {
            Some(g) => format!("group {} (gid {})", g.name, config.gid),
            None => format!("group {DEFAULT_GROUPNAME} (gid {})", config.gid),
        },
    ));

    let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(config.uid)).map_err(
        |source| IdentityError::Lookup {
            subject: format!("uid {}", config.uid),
            source,
        },
    )?;
    let home = match &config.home_override {
        Some(home) => home.clone(),
        None => user
            .as_ref()
            .map(|u| u.dir.clone())
            .unwrap_or_else(|| DEFAULT_HOME.into()),
    };
    actions.push(plan_action(
        "user",
        user.is_some(),
        match &user {
            Some(u) => format!("user {} (uid {})", u.name, config.uid),
            None => format!("user {DEFAULT_USERNAME} (uid {})", config.uid),
        },
    ));

    let workdir = config
        .workdir
        .clone()
        .unwrap_or_else(|| home.join(DEFAULT_WORKDIR_NAME));
    let default_dir = workdir.join(DEFAULT_PROJECT_DIR);
    actions.push(plan_action(
        "workspace",
        fs::symlink_metadata(&default_dir).is_ok(),
        format!("workspace {}", workdir.display()),
    ));

    // A real run re-asserts mode and ownership on a pre-existing
    // credentials directory, so the plan only reports a skip when there
    // is truly nothing to repair.
    let ssh_dir = home.join(SSH_DIR_NAME);
    actions.push(match fs::symlink_metadata(&ssh_dir) {
        Ok(meta)
            if meta.mode() & 0o777 != 0o700
                || meta.uid() != config.uid
                || meta.gid() != config.gid =>
        {
            BootstrapAction {
                kind: "ssh-dir",
                description: format!(
                    "[plan] restore mode 0700 and ownership on {}",
                    ssh_dir.display()
                ),
                skipped: false,
            }
        },
        Ok(_) => plan_action(
            "ssh-dir",
            true,
            format!("credentials directory {}", ssh_dir.display()),
        ),
        Err(_) => plan_action(
            "ssh-dir",
            false,
            format!("credentials directory {}", ssh_dir.display()),
        ),
    });

    for material in &config.slots {
        let target = ssh_dir.join(material.slot.file_name);
        let (skipped, description) = if material.value.is_none() {
            (
                true,
                format!(
                    "[skip] {} key ({} unset)",
                    material.slot.label, material.slot.env_var
                ),
            )
        } else if fs::symlink_metadata(&target).is_ok() {
            (
                true,
                format!(
                    "[skip] {} key at {} (already present)",
                    material.slot.label,
                    target.display()
                ),
            )
        } else {
            (
                false,
                format!("[plan] {} key at {}", material.slot.label, target.display()),
            )
        };
        actions.push(BootstrapAction {
            kind: "ssh-key",
            description,
            skipped,
        });
    }

    Ok(BootstrapReceipt {
        schema: RECEIPT_SCHEMA,
        dry_run: true,
        uid: config.uid,
        gid: config.gid,
        actions,
    })
}

fn provision_action(
    kind: &'static str,
    outcome: ProvisionOutcome,
    subject: String,
) -> BootstrapAction {
    let skipped = outcome == ProvisionOutcome::SkippedExisting;
    let description = if skipped {
        format!("{subject} (already present)")
    } else {
        subject
    };
    BootstrapAction {
        kind,
        description,
        skipped,
    }
}

fn plan_action(kind: &'static str, exists: bool, subject: String) -> BootstrapAction {
    BootstrapAction {
        kind,
        description: if exists {
            format!("[skip] {subject} (already present)")
        } else {
            format!("[plan] {subject}")
        },
        skipped: exists,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::config::KEY_SLOTS;

    use super::*;

    fn config_for(home: &Path) -> BootstrapConfig {
        BootstrapConfig {
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            workdir: None,
            home_override: Some(home.to_path_buf()),
            slots: KEY_SLOTS
                .iter()
                .map(|slot| crate::config::SlotMaterial { slot, value: None })
                .collect(),
        }
    }

    #[test]
    fn plan_is_read_only() {
        let home = tempfile::tempdir().expect("tempdir");
        let config = config_for(home.path());

        let receipt = plan_bootstrap(&config).expect("plan");
        assert!(receipt.dry_run);
        assert_eq!(receipt.schema, RECEIPT_SCHEMA);
        // Nothing exists yet, so the plan proposes workspace and ssh dir...
        assert!(!receipt.actions.is_empty());
        // ...but must not have created either of them.
        assert!(!home.path().join(DEFAULT_WORKDIR_NAME).exists());
        assert!(!home.path().join(SSH_DIR_NAME).exists());
    }

    #[test]
    fn plan_reports_existing_state_as_skipped() {
        let home = tempfile::tempdir().expect("tempdir");
        let config = config_for(home.path());
        fs::create_dir_all(home.path().join(DEFAULT_WORKDIR_NAME).join(DEFAULT_PROJECT_DIR))
            .expect("seed workspace");

        let receipt = plan_bootstrap(&config).expect("plan");
        let workspace = receipt
            .actions
            .iter()
            .find(|a| a.kind == "workspace")
            .expect("workspace action");
        assert!(workspace.skipped);
        assert!(workspace.description.starts_with("[skip]"));
    }

    #[test]
    fn plan_reports_loose_ssh_dir_as_repair_without_touching_it() {
        use std::os::unix::fs::PermissionsExt;

        let home = tempfile::tempdir().expect("tempdir");
        let config = config_for(home.path());
        let ssh_dir = home.path().join(SSH_DIR_NAME);
        fs::create_dir(&ssh_dir).expect("seed ssh dir");
        fs::set_permissions(&ssh_dir, fs::Permissions::from_mode(0o755)).expect("loosen");

        let receipt = plan_bootstrap(&config).expect("plan");
        let action = receipt
            .actions
            .iter()
            .find(|a| a.kind == "ssh-dir")
            .expect("ssh-dir action");
        assert!(!action.skipped, "a loose mode is pending work: {action:?}");
        assert!(action.description.contains("0700"), "got: {}", action.description);

        // Still a dry run: the mode must not have been repaired.
        let mode = fs::metadata(&ssh_dir).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn empty_command_fails_before_any_phase_runs() {
        struct PanicHandoff;
        impl ProcessHandoff for PanicHandoff {
            fn exec_as(
                &self,
                _identity: &RuntimeIdentity,
                _argv: &[String],
            ) -> Result<Infallible, HandoffError> {
                panic!("handoff must not be reached");
            }
        }

        let home = tempfile::tempdir().expect("tempdir");
        let config = config_for(home.path());

        let err = run_bootstrap(&config, &[], &PanicHandoff).unwrap_err();
        assert!(
            matches!(err, BootstrapError::Handoff(HandoffError::EmptyCommand)),
            "got: {err}"
        );
        // The failed invocation must not have provisioned anything.
        assert!(!home.path().join(SSH_DIR_NAME).exists());
    }

    #[test]
    fn receipt_serializes_with_schema_tag() {
        let receipt = BootstrapReceipt {
            schema: RECEIPT_SCHEMA,
            dry_run: false,
            uid: 1000,
            gid: 1000,
            actions: vec![BootstrapAction {
                kind: "group",
                description: "group mcp (gid 1000)".to_string(),
                skipped: true,
            }],
        };
        let json = serde_json::to_value(&receipt).expect("serialize");
        assert_eq!(json["schema"], RECEIPT_SCHEMA);
        assert_eq!(json["actions"][0]["kind"], "group");
        assert_eq!(json["actions"][0]["skipped"], true);
    }
}
