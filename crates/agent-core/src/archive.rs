//! Archive inspection and extraction for ZIP/RAR/7Z, with the "single top
//! directory" flattening behavior the legacy extractor relies on.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AgentError;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Rar,
    SevenZip,
}

impl ArchiveFormat {
    fn from_extension(path: &Path) -> Result<Self, AgentError> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("zip") => Ok(ArchiveFormat::Zip),
            Some("rar") => Ok(ArchiveFormat::Rar),
            Some("7z") | Some("7zip") => Ok(ArchiveFormat::SevenZip),
            other => Err(AgentError::UnsupportedArchive(
                other.unwrap_or_default().to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub format: ArchiveFormat,
    pub single_top_dir: bool,
    pub top_dir_name: Option<String>,
    pub file_count: usize,
    pub names: Vec<String>,
}

fn list_zip_names(path: &Path) -> Result<Vec<String>, AgentError> {
    let file = fs::File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| AgentError::ArchiveCorrupt(e.to_string()))?;
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| AgentError::ArchiveCorrupt(e.to_string()))?;
        names.push(entry.name().to_string());
    }
    Ok(names)
}

fn list_sevenz_names(path: &Path) -> Result<Vec<String>, AgentError> {
    let archive = sevenz_rust::SevenZReader::open(path, sevenz_rust::Password::empty())
        .map_err(|e| AgentError::ArchiveCorrupt(e.to_string()))?;
    Ok(archive
        .archive()
        .files
        .iter()
        .map(|f| f.name().to_string())
        .collect())
}

fn list_rar_names(path: &Path) -> Result<Vec<String>, AgentError> {
    let archive = unrar::Archive::new(path)
        .open_for_listing()
        .map_err(|e| AgentError::ArchiveCorrupt(e.to_string()))?;
    let mut names = Vec::new();
    for entry in archive {
        let entry = entry.map_err(|e| AgentError::ArchiveCorrupt(e.to_string()))?;
        names.push(entry.filename.to_string_lossy().to_string());
    }
    Ok(names)
}

/// Decide whether every entry lives under one shared top-level directory
/// with no bare file at the archive root. Mirrors the legacy analyzer:
/// normalize `\` to `/`, split, and track a `root_files` sentinel for any
/// root-level entry whose last segment looks like a file.
fn analyze_single_top_dir(names: &[String]) -> (bool, Option<String>) {
    let mut top_dirs = std::collections::BTreeSet::new();
    let mut has_root_file = false;

    for name in names {
        let normalized = name.replace('\\', "/");
        let parts: Vec<&str> = normalized.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() > 1 {
            top_dirs.insert(parts[0].to_string());
        } else if let Some(last) = parts.last() {
            if last.contains('.') {
                has_root_file = true;
            } else if !last.is_empty() {
                top_dirs.insert(last.to_string());
            }
        }
    }

    let single = top_dirs.len() == 1 && !has_root_file;
    let top_dir = if top_dirs.len() == 1 {
        top_dirs.into_iter().next()
    } else {
        None
    };
    (single, top_dir)
}

pub fn inspect(path: &Path) -> Result<ArchiveInfo, AgentError> {
    let format = ArchiveFormat::from_extension(path)?;
    let names = match format {
        ArchiveFormat::Zip => list_zip_names(path)?,
        ArchiveFormat::SevenZip => list_sevenz_names(path)?,
        ArchiveFormat::Rar => list_rar_names(path)?,
    };
    let (single_top_dir, top_dir_name) = analyze_single_top_dir(&names);
    debug!(?format, single_top_dir, ?top_dir_name, "inspected archive");
    Ok(ArchiveInfo {
        format,
        single_top_dir,
        top_dir_name,
        file_count: names.len(),
        names,
    })
}

fn extract_zip(src: &Path, dest: &Path) -> Result<(), AgentError> {
    let file = fs::File::open(src)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| AgentError::ArchiveCorrupt(e.to_string()))?;
    archive
        .extract(dest)
        .map_err(|e| AgentError::ArchiveCorrupt(e.to_string()))
}

fn extract_sevenz(src: &Path, dest: &Path) -> Result<(), AgentError> {
    sevenz_rust::decompress_file(src, dest).map_err(|e| AgentError::ArchiveCorrupt(e.to_string()))
}

fn extract_rar(src: &Path, dest: &Path) -> Result<(), AgentError> {
    fs::create_dir_all(dest)?;
    let mut archive = unrar::Archive::new(src)
        .open_for_processing()
        .map_err(|e| AgentError::ArchiveCorrupt(e.to_string()))?;
    while let Some(header) = archive
        .read_header()
        .map_err(|e| AgentError::ArchiveCorrupt(e.to_string()))?
    {
        archive = if header.entry().is_file() {
            header
                .extract_with_base(dest)
                .map_err(|e| AgentError::ArchiveCorrupt(e.to_string()))?
        } else {
            header
                .skip()
                .map_err(|e| AgentError::ArchiveCorrupt(e.to_string()))?
        };
    }
    Ok(())
}

/// Extract `src` into `target_dir`, flattening away a single top directory
/// if the archive has one. Any pre-existing `target_dir` is removed first;
/// on failure the partially created target is removed.
pub fn extract(src: &Path, target_dir: &Path) -> Result<(), AgentError> {
    if target_dir.exists() {
        fs::remove_dir_all(target_dir)?;
        warn!(target = %target_dir.display(), "removed pre-existing target directory");
    }

    let info = inspect(src)?;
    let parent = target_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)?;

    let result = if info.single_top_dir {
        extract_into(src, info.format, &parent).and_then(|_| {
            let top_dir_name = info
                .top_dir_name
                .as_ref()
                .expect("single_top_dir implies a top_dir_name");
            let extracted = parent.join(top_dir_name);
            fs::rename(&extracted, target_dir).map_err(AgentError::from)
        })
    } else {
        extract_into(src, info.format, target_dir)
    };

    if result.is_err() && target_dir.exists() {
        let _ = fs::remove_dir_all(target_dir);
    }

    if result.is_ok() {
        info!(src = %src.display(), target = %target_dir.display(), "extracted archive");
    }
    result
}

fn extract_into(src: &Path, format: ArchiveFormat, dest: &Path) -> Result<(), AgentError> {
    fs::create_dir_all(dest)?;
    match format {
        ArchiveFormat::Zip => extract_zip(src, dest),
        ArchiveFormat::SevenZip => extract_sevenz(src, dest),
        ArchiveFormat::Rar => extract_rar(src, dest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_top_dir_detected_when_all_entries_share_a_root() {
        let names = vec![
            "1.2.3/".to_string(),
            "1.2.3/main.py".to_string(),
            "1.2.3/lib/util.py".to_string(),
        ];
        let (single, top) = analyze_single_top_dir(&names);
        assert!(single);
        assert_eq!(top.as_deref(), Some("1.2.3"));
    }

    #[test]
    fn bare_root_file_disqualifies_single_top_dir() {
        let names = vec!["1.2.3/main.py".to_string(), "README.md".to_string()];
        let (single, _) = analyze_single_top_dir(&names);
        assert!(!single);
    }

    #[test]
    fn multiple_top_level_dirs_disqualify_single_top_dir() {
        let names = vec!["a/main.py".to_string(), "b/util.py".to_string()];
        let (single, top) = analyze_single_top_dir(&names);
        assert!(!single);
        assert_eq!(top, None);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = ArchiveFormat::from_extension(Path::new("payload.tar.gz")).unwrap_err();
        assert!(matches!(err, AgentError::UnsupportedArchive(_)));
    }
}
