use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{PlanError, Result};

/// Hex encoded sha256 of a file's content, read in chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        PlanError::with_origin(
            format!("cannot open {}: {}", path.display(), e),
            "checksum.sha256_file",
        )
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];
    loop {
        let count = file.read(&mut buffer).map_err(|e| {
            PlanError::with_origin(
                format!("cannot read {}: {}", path.display(), e),
                "checksum.sha256_file",
            )
        })?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex encoded digest reflecting the state of a file tree.
///
/// Hashes one `path:mode:size:mtime` record per regular file, so a tree
/// scan is enough to detect changes without reading file contents. Files
/// and directories whose name starts with a dot are skipped. Entries are
/// visited in sorted order so the digest is stable for a given tree.
pub fn filetree_state(path: &Path) -> Result<String> {
    use std::os::unix::fs::MetadataExt;

    let mut hasher = Sha256::new();
    let walker = walkdir::WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e));

    for entry in walker {
        let entry = entry.map_err(|e| {
            PlanError::with_origin(
                format!("cannot walk {}: {}", path.display(), e),
                "checksum.filetree_state",
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry.metadata().map_err(|e| {
            PlanError::with_origin(
                format!("cannot stat {}: {}", entry.path().display(), e),
                "checksum.filetree_state",
            )
        })?;
        let record = format!(
            "{}:{}:{}:{}.{}",
            entry.path().display(),
            meta.mode(),
            meta.size(),
            meta.mtime(),
            meta.mtime_nsec()
        );
        hasher.update(record.as_bytes());
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}
