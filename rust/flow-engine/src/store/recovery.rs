//! Corruption recovery for the run store.
//!
//! When `flows.db` is structurally corrupt (torn write, bad disk), the
//! engine does not try to repair it in place. The damaged database and
//! its WAL sidecars are rotated aside under a timestamped name, a small
//! JSON notice is written next to the store describing what happened, and
//! a fresh empty store is initialized at the original path. Runs recorded
//! only in the rotated file are lost to the engine but remain on disk for
//! manual inspection.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::StatePaths;
use crate::store::FlowStore;

/// Notice written next to a rotated store so operators (and the HTTP
/// surface) can see that a recovery happened and where the damaged file
/// went.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionNotice {
    /// Always `"corrupt"`.
    pub status: String,
    /// Where the damaged database was moved.
    pub backup_path: PathBuf,
    /// RFC 3339 timestamp of the rotation.
    pub rotated_at: String,
    /// Display form of the error that triggered recovery.
    pub reason: String,
}

/// Outcome of a successful recovery.
#[derive(Debug)]
pub struct Recovery {
    /// Freshly initialized empty store at the original path.
    pub store: FlowStore,
    /// The notice that was persisted.
    pub notice: CorruptionNotice,
}

/// Rotate a corrupt store aside and initialize a fresh one.
///
/// # Errors
///
/// Returns error if the rotation or re-initialization fails; in that case
/// the store stays unavailable and callers should surface
/// [`crate::error::FlowError::StoreUnavailable`].
pub async fn recover_store(paths: &StatePaths, reason: &str) -> Result<Recovery> {
    let db_path = paths.db_path();
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let backup_path = db_path.with_extension(format!("db.corrupt.{timestamp}"));

    error!(
        db = %db_path.display(),
        backup = %backup_path.display(),
        reason,
        "Flows database is corrupt, rotating it aside"
    );

    rotate_database_files(&db_path, &backup_path)?;

    let notice = CorruptionNotice {
        status: "corrupt".to_string(),
        backup_path: backup_path.clone(),
        rotated_at: chrono::Utc::now().to_rfc3339(),
        reason: reason.to_string(),
    };
    write_notice(&paths.corruption_notice_path(), &notice)?;

    let store = FlowStore::new(&db_path)
        .await
        .context("Failed to initialize replacement flows database")?;

    Ok(Recovery { store, notice })
}

/// Read the corruption notice, if one exists.
///
/// # Errors
///
/// Returns error if the notice exists but cannot be parsed.
pub fn read_notice(paths: &StatePaths) -> Result<Option<CorruptionNotice>> {
    let path = paths.corruption_notice_path();
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read corruption notice at {}", path.display()))?;
    let notice = serde_json::from_str(&content).context("Failed to parse corruption notice")?;
    Ok(Some(notice))
}

fn rotate_database_files(db_path: &Path, backup_path: &Path) -> Result<()> {
    if db_path.exists() {
        std::fs::rename(db_path, backup_path).with_context(|| {
            format!(
                "Failed to rotate corrupt database to {}",
                backup_path.display()
            )
        })?;
    }

    // WAL sidecars from the damaged store must not be replayed into the
    // fresh database.
    for suffix in ["-wal", "-shm"] {
        let sidecar = sidecar_path(db_path, suffix);
        if sidecar.exists() {
            let backup_sidecar = sidecar_path(backup_path, suffix);
            if let Err(e) = std::fs::rename(&sidecar, &backup_sidecar) {
                warn!(
                    path = %sidecar.display(),
                    error = %e,
                    "Failed to rotate WAL sidecar, removing it instead"
                );
                std::fs::remove_file(&sidecar).with_context(|| {
                    format!("Failed to remove WAL sidecar {}", sidecar.display())
                })?;
            }
        }
    }

    Ok(())
}

fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    db_path.with_file_name(name)
}

/// Write the notice atomically (temp file + rename).
fn write_notice(path: &Path, notice: &CorruptionNotice) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(notice)?;
    std::fs::write(&tmp, content)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move notice into place at {}", path.display()))?;
    Ok(())
}
