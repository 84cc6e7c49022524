//! The recordings directory.
//!
//! Every name coming from a caller goes through [`resolve`] before it
//! touches the filesystem. A name is a single normal path component:
//! separators, `.`, `..` and absolute paths are refused outright, and an existing target is
//! canonicalised and checked to still sit inside the directory (symlinks).

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use pgnhub_types::{HubError, RecordingFile, RecordingFormat};
use tracing::{debug, info};

/// Map a caller-supplied file name to a path inside `dir`.
pub fn resolve(dir: &Path, name: &str) -> Result<PathBuf, HubError> {
    let traversal = || HubError::PathTraversal(name.to_string());
    if name.trim().is_empty() {
        return Err(HubError::invalid("fileName", "is required"));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(traversal());
    }
    let candidate = Path::new(name);
    if candidate.is_absolute()
        || candidate.components().count() != 1
        || !matches!(candidate.components().next(), Some(Component::Normal(_)))
    {
        return Err(traversal());
    }

    let path = dir.join(candidate);
    if path.exists() {
        let root = dir.canonicalize()?;
        let real = path.canonicalize()?;
        if !real.starts_with(&root) {
            return Err(traversal());
        }
    }
    Ok(path)
}

/// Resolve a name that must exist.
pub fn resolve_existing(dir: &Path, name: &str) -> Result<PathBuf, HubError> {
    let path = resolve(dir, name)?;
    if !path.is_file() {
        return Err(HubError::NotFound(format!("recording '{name}'")));
    }
    Ok(path)
}

/// Estimated message count: one message per line, minus the bracket lines
/// of a JSON array.
fn estimate_messages(path: &Path, format: Option<RecordingFormat>) -> u64 {
    let Ok(file) = fs::File::open(path) else {
        return 0;
    };
    let lines = BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter(|l| !l.trim().is_empty())
        .count() as u64;
    match format {
        Some(RecordingFormat::JsonArray) => lines.saturating_sub(2),
        _ => lines,
    }
}

/// Every regular file in `dir`, newest first. A missing directory lists
/// as empty.
pub fn list(dir: &Path) -> Result<Vec<RecordingFile>, HubError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let format = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(RecordingFormat::from_extension);
        let created: DateTime<Utc> = meta
            .created()
            .or_else(|_| meta.modified())
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        files.push(RecordingFile {
            message_count: estimate_messages(&entry.path(), format),
            name,
            size: meta.len(),
            created,
            format,
        });
    }
    files.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.name.cmp(&b.name)));
    debug!(dir = %dir.display(), count = files.len(), "listed recordings");
    Ok(files)
}

/// Delete `name`, refusing the file currently being written.
pub fn delete(dir: &Path, name: &str, active: Option<&Path>) -> Result<(), HubError> {
    let path = resolve_existing(dir, name)?;
    if active.is_some_and(|a| a == path) {
        return Err(HubError::FileSystem(format!(
            "cannot delete '{name}' while it is being recorded"
        )));
    }
    fs::remove_file(&path)?;
    info!(file = %name, "recording deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_attempts_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["../etc/passwd", "..", ".", "a/b.raw", "a\\b.raw", "/etc/passwd", "x/../../y"] {
            assert!(
                matches!(resolve(dir.path(), name), Err(HubError::PathTraversal(_))),
                "accepted {name}"
            );
        }
        assert!(resolve(dir.path(), "").is_err());
        assert_eq!(resolve(dir.path(), "ok.raw").unwrap(), dir.path().join("ok.raw"));
    }

    #[test]
    fn dots_inside_a_name_are_allowed() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["trip..raw", "2024..06.json", "...log"] {
            assert_eq!(resolve(dir.path(), name).unwrap(), dir.path().join(name));
        }
        fs::write(dir.path().join("trip..raw"), "x\n").unwrap();
        assert_eq!(
            resolve_existing(dir.path(), "trip..raw").unwrap(),
            dir.path().join("trip..raw")
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_directory_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::NamedTempFile::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link.raw")).unwrap();
        assert!(matches!(
            resolve(dir.path(), "link.raw"),
            Err(HubError::PathTraversal(_))
        ));
    }

    #[test]
    fn listing_estimates_counts_and_formats() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.json"), "[\n{\"pgn\":1},\n{\"pgn\":2}\n]\n").unwrap();
        fs::write(dir.path().join("b.raw"), "one\ntwo\nthree\n").unwrap();
        fs::write(dir.path().join("c.unknown"), "x\n").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let files = list(dir.path()).unwrap();
        assert_eq!(files.len(), 3);
        let a = files.iter().find(|f| f.name == "a.json").unwrap();
        assert_eq!(a.message_count, 2);
        assert_eq!(a.format, Some(RecordingFormat::JsonArray));
        let b = files.iter().find(|f| f.name == "b.raw").unwrap();
        assert_eq!(b.message_count, 3);
        assert_eq!(b.format, Some(RecordingFormat::Passthrough));
        let c = files.iter().find(|f| f.name == "c.unknown").unwrap();
        assert_eq!(c.format, None);
    }

    #[test]
    fn missing_directory_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn delete_refuses_active_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.raw");
        fs::write(&path, "x\n").unwrap();

        assert!(matches!(
            delete(dir.path(), "live.raw", Some(&path)),
            Err(HubError::FileSystem(_))
        ));
        assert!(path.exists());
        delete(dir.path(), "live.raw", None).unwrap();
        assert!(!path.exists());
        assert!(matches!(
            delete(dir.path(), "live.raw", None),
            Err(HubError::NotFound(_))
        ));
    }
}
