//! Workspace provisioning: the project root and its mandatory `default/`
//! subdirectory.
//!
//! The `default/` subdirectory doubles as the first-boot marker. When it is
//! absent the whole tree is created and recursively chowned to the runtime
//! identity; when it is present the tree is left alone — users may have
//! created nested projects with their own ownership, and re-chowning would
//! clobber them. A pre-existing workspace the identity cannot write to is a
//! warning, not an error: ownership may be managed externally through
//! bind-mount permissions.

use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::fcntl::AtFlags;
use nix::unistd::{self, Gid, Uid};
use thiserror::Error;

use super::identity::RuntimeIdentity;
use super::ProvisionOutcome;

/// Mandatory subdirectory of the workspace root.
pub const DEFAULT_PROJECT_DIR: &str = "default";

/// Errors from workspace provisioning.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// A workspace path exists but is not a directory.
    #[error("workspace path exists but is not a directory: {path}")]
    NotADirectory { path: String },

    /// A workspace path is a symlink (refused, TOCTOU risk).
    #[error("refusing to operate on symlink workspace path: {path}")]
    Symlink { path: String },

    /// Filesystem operation failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Ownership could not be applied.
    #[error("cannot change ownership of {path}: {source}")]
    Chown {
        path: String,
        #[source]
        source: nix::Error,
    },
}

/// Ensure `<root>/default` exists and the workspace is usable by the
/// identity.
///
/// First boot (no `default/`): creates the tree and recursively chowns the
/// root to the identity. Later boots: verifies writability from the stat
/// bits and warns — without failing — when the identity cannot write.
pub fn provision_workspace(
    root: &Path,
    identity: &RuntimeIdentity,
) -> Result<ProvisionOutcome, WorkspaceError> {
    let default_dir = root.join(DEFAULT_PROJECT_DIR);

    match fs::symlink_metadata(&default_dir) {
        Ok(meta) if meta.file_type().is_symlink() => Err(WorkspaceError::Symlink {
            path: default_dir.display().to_string(),
        }),
        Ok(meta) if meta.is_dir() => {
            if !writable_by(&meta, identity.uid, identity.gid) {
                tracing::warn!(
                    path = %default_dir.display(),
                    uid = identity.uid,
                    gid = identity.gid,
                    owner_uid = meta.uid(),
                    owner_gid = meta.gid(),
                    "existing workspace is not writable by the runtime identity; \
                     continuing without re-owning it"
                );
            } else {
                tracing::info!(path = %default_dir.display(), "workspace already provisioned");
            }
            Ok(ProvisionOutcome::SkippedExisting)
        },
        Ok(_) => Err(WorkspaceError::NotADirectory {
            path: default_dir.display().to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Ok(meta) = fs::symlink_metadata(root) {
                if meta.file_type().is_symlink() {
                    return Err(WorkspaceError::Symlink {
                        path: root.display().to_string(),
                    });
                }
                if !meta.is_dir() {
                    return Err(WorkspaceError::NotADirectory {
                        path: root.display().to_string(),
                    });
                }
            }
            fs::create_dir_all(&default_dir).map_err(|source| WorkspaceError::Io {
                context: format!("cannot create workspace {}", default_dir.display()),
                source,
            })?;
            chown_tree_no_symlink(
                root,
                Uid::from_raw(identity.uid),
                Gid::from_raw(identity.gid),
            )?;
            tracing::info!(
                path = %default_dir.display(),
                uid = identity.uid,
                gid = identity.gid,
                "created workspace and applied ownership"
            );
            Ok(ProvisionOutcome::Created)
        },
        Err(source) => Err(WorkspaceError::Io {
            context: format!("cannot stat {}", default_dir.display()),
            source,
        }),
    }
}

/// Whether the stat bits allow the given identity to write.
fn writable_by(meta: &fs::Metadata, uid: u32, gid: u32) -> bool {
    mode_allows_write(meta.mode(), meta.uid(), meta.gid(), uid, gid)
}

fn mode_allows_write(mode: u32, owner_uid: u32, owner_gid: u32, uid: u32, gid: u32) -> bool {
    if uid == 0 {
        return true;
    }
    if uid == owner_uid {
        return mode & 0o200 != 0;
    }
    if gid == owner_gid {
        return mode & 0o020 != 0;
    }
    mode & 0o002 != 0
}

/// Recursively apply ownership without ever following a symlink.
fn chown_tree_no_symlink(path: &Path, uid: Uid, gid: Gid) -> Result<(), WorkspaceError> {
    let cwd_fd = fs::File::open(".").map_err(|source| WorkspaceError::Io {
        context: "cannot open current directory for fchownat".to_string(),
        source,
    })?;
    let mut stack = vec![path.to_path_buf()];
    while let Some(current) = stack.pop() {
        let metadata = fs::symlink_metadata(&current).map_err(|source| WorkspaceError::Io {
            context: format!("cannot stat {}", current.display()),
            source,
        })?;
        if metadata.file_type().is_symlink() {
            return Err(WorkspaceError::Symlink {
                path: current.display().to_string(),
            });
        }
        unistd::fchownat(
            Some(cwd_fd.as_raw_fd()),
            current.as_path(),
            Some(uid),
            Some(gid),
            AtFlags::AT_SYMLINK_NOFOLLOW,
        )
        .map_err(|source| WorkspaceError::Chown {
            path: current.display().to_string(),
            source,
        })?;
        if metadata.is_dir() {
            let entries = fs::read_dir(&current).map_err(|source| WorkspaceError::Io {
                context: format!("cannot read directory {}", current.display()),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| WorkspaceError::Io {
                    context: format!("cannot read entry under {}", current.display()),
                    source,
                })?;
                stack.push(entry.path());
            }
        }
    }
    Ok(())
}
