//! File-level mechanics of the agent's in-place self-upgrade: snapshotting
//! the current installation, detecting the real source subdirectory inside
//! an extracted archive, and swapping the installation directory in place.

use std::path::{Path, PathBuf};

use agent_core::AgentError;
use tracing::{info, warn};

/// Wipe `backup_dir` if present, then copy `install_dir` into it verbatim.
pub fn snapshot(install_dir: &Path, backup_dir: &Path) -> Result<(), AgentError> {
    if backup_dir.exists() {
        std::fs::remove_dir_all(backup_dir)?;
    }
    if install_dir.exists() {
        copy_dir_recursive(install_dir, backup_dir)?;
    } else {
        std::fs::create_dir_all(backup_dir)?;
    }
    info!(backup = %backup_dir.display(), "snapshotted current installation");
    Ok(())
}

/// Find the directory that actually holds `entry_name`: the extracted root
/// itself, or its sole child subdirectory if the archive wrapped everything
/// one level deeper than expected.
pub fn detect_source_dir(extracted_root: &Path, entry_name: &str) -> Result<PathBuf, AgentError> {
    if extracted_root.join(entry_name).exists() {
        return Ok(extracted_root.to_path_buf());
    }

    let mut subdirs = std::fs::read_dir(extracted_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir());

    let candidate = subdirs.next();
    if subdirs.next().is_some() {
        return Err(AgentError::EntryNotFound);
    }

    match candidate {
        Some(entry) if entry.path().join(entry_name).exists() => Ok(entry.path()),
        _ => Err(AgentError::EntryNotFound),
    }
}

/// Wipe `install_dir` and replace its contents with `source_dir`'s.
pub fn replace_install_dir(install_dir: &Path, source_dir: &Path) -> Result<(), AgentError> {
    if install_dir.exists() {
        std::fs::remove_dir_all(install_dir)?;
    }
    copy_dir_recursive(source_dir, install_dir)?;
    info!(install = %install_dir.display(), "replaced installation directory");
    Ok(())
}

/// Restore `install_dir` from `backup_dir`. Used by the rollback path; any
/// failure here is the caller's signal to escalate to a catastrophic exit.
pub fn restore_from_backup(install_dir: &Path, backup_dir: &Path) -> Result<(), AgentError> {
    warn!(backup = %backup_dir.display(), "restoring installation from backup");
    replace_install_dir(install_dir, backup_dir)
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<(), AgentError> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dest_path = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), dest_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_source_dir_prefers_extracted_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("IoTAgent.py"), "x").unwrap();
        let found = detect_source_dir(dir.path(), "IoTAgent.py").unwrap();
        assert_eq!(found, dir.path());
    }

    #[test]
    fn detect_source_dir_descends_into_sole_child() {
        let dir = tempfile::tempdir().unwrap();
        let child = dir.path().join("release-1.2.3");
        std::fs::create_dir(&child).unwrap();
        std::fs::write(child.join("IoTAgent.py"), "x").unwrap();
        let found = detect_source_dir(dir.path(), "IoTAgent.py").unwrap();
        assert_eq!(found, child);
    }

    #[test]
    fn detect_source_dir_fails_with_multiple_children() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        assert!(detect_source_dir(dir.path(), "IoTAgent.py").is_err());
    }

    #[test]
    fn snapshot_then_restore_round_trips_contents() {
        let root = tempfile::tempdir().unwrap();
        let install = root.path().join("install");
        let backup = root.path().join("backup");
        std::fs::create_dir(&install).unwrap();
        std::fs::write(install.join("version.txt"), "1.0.0").unwrap();

        snapshot(&install, &backup).unwrap();
        std::fs::write(install.join("version.txt"), "2.0.0").unwrap();
        restore_from_backup(&install, &backup).unwrap();

        let content = std::fs::read_to_string(install.join("version.txt")).unwrap();
        assert_eq!(content, "1.0.0");
    }
}
