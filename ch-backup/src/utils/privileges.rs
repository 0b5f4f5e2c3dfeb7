//! Dropping root privileges to the database service account.

use crate::utils::errors::{BackupError, Result};
use nix::unistd::{Gid, Group, Uid, User};
use std::path::Path;

/// Switch the effective group and user. No-op when not running as root.
pub fn drop_privileges(user: &str, group: &str) -> Result<()> {
    if !Uid::effective().is_root() {
        tracing::debug!("Not running as root, keeping current privileges");
        return Ok(());
    }

    let (uid, gid) = lookup_ids(user, group)?;

    nix::unistd::setgid(gid)
        .map_err(|e| BackupError::Config(format!("setgid({group}) failed: {e}")))?;
    nix::unistd::setuid(uid)
        .map_err(|e| BackupError::Config(format!("setuid({user}) failed: {e}")))?;

    tracing::info!(user, group, "Dropped privileges");
    Ok(())
}

/// Recursively chown a directory tree to `user:group`.
pub fn chown_tree(path: &Path, user: &str, group: &str) -> Result<()> {
    let (uid, gid) = lookup_ids(user, group)?;
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry.map_err(|e| BackupError::Io(e.into()))?;
        nix::unistd::chown(entry.path(), Some(uid), Some(gid)).map_err(|e| {
            BackupError::Database(format!("chown {}: {e}", entry.path().display()))
        })?;
    }
    Ok(())
}

fn lookup_ids(user: &str, group: &str) -> Result<(Uid, Gid)> {
    let user_entry = User::from_name(user)
        .map_err(|e| BackupError::Config(format!("user lookup {user}: {e}")))?
        .ok_or_else(|| BackupError::Config(format!("unknown user: {user}")))?;
    let group_entry = Group::from_name(group)
        .map_err(|e| BackupError::Config(format!("group lookup {group}: {e}")))?
        .ok_or_else(|| BackupError::Config(format!("unknown group: {group}")))?;
    Ok((user_entry.uid, group_entry.gid))
}
