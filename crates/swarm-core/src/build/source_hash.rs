//! Content hash of an agent's build context.
//!
//! All regular files below the agent directory are hashed in sorted
//! relative-path order as `relative_path \0 content \0`. Hidden entries,
//! `__pycache__`, `node_modules` and `target` are skipped, so editor and
//! tool droppings never invalidate the image cache.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

const SKIPPED_DIRS: &[&str] = &["__pycache__", "node_modules", "target"];

#[derive(Debug, thiserror::Error)]
#[error("cannot read {path}: {source}")]
pub struct SourceError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

fn read_err(path: &Path) -> impl FnOnce(std::io::Error) -> SourceError + '_ {
    move |source| SourceError {
        path: path.to_path_buf(),
        source,
    }
}

/// Hex SHA-256 of the source tree rooted at `dir`.
pub fn hash_source_tree(dir: &Path) -> Result<String, SourceError> {
    let meta = std::fs::metadata(dir).map_err(read_err(dir))?;
    if !meta.is_dir() {
        return Err(SourceError {
            path: dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        });
    }

    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for path in files {
        let relative = path.strip_prefix(dir).unwrap_or(&path);
        // Forward slashes so the hash is identical across platforms.
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        hasher.update(relative.as_bytes());
        hasher.update(b"\0");
        let content = std::fs::read(&path).map_err(read_err(&path))?;
        hasher.update(&content);
        hasher.update(b"\0");
    }
    Ok(hex::encode(hasher.finalize()))
}

fn is_skipped(name: &str) -> bool {
    name.starts_with('.') || SKIPPED_DIRS.contains(&name)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), SourceError> {
    for entry in std::fs::read_dir(dir).map_err(read_err(dir))? {
        let entry = entry.map_err(read_err(dir))?;
        let path = entry.path();
        let name = entry.file_name();
        if is_skipped(&name.to_string_lossy()) {
            continue;
        }
        let file_type = entry.file_type().map_err(read_err(&path))?;
        if file_type.is_dir() {
            collect_files(&path, files)?;
        } else if file_type.is_file() {
            files.push(path);
        }
    }
    Ok(())
}
