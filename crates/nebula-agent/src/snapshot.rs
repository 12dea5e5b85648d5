//! Shared-folder directory snapshots.

use std::fs;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

use nebula_core::Result;
use nebula_core::protocol::{DirectoryInfo, DirectorySnapshot, FileEntryInfo};

/// Recursively scan the shared folder into a snapshot payload.
///
/// Unreadable entries are skipped with a warning rather than failing the
/// whole scan. Paths in the snapshot are relative to the shared folder.
pub fn scan_shared_folder(agent_id: &str, shared: &Path) -> Result<DirectorySnapshot> {
    let mut files = Vec::new();
    let mut total_size: u64 = 0;
    let mut total_files: usize = 0;

    let mut stack = vec![shared.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Error reading directory");
                continue;
            }
        };
        let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Error accessing path");
                    continue;
                }
            };
            let rel = path
                .strip_prefix(shared)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");

            let kind = if meta.is_dir() {
                stack.push(path.clone());
                "directory"
            } else {
                total_files += 1;
                total_size += meta.len();
                "file"
            };

            files.push(FileEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: rel,
                size: if meta.is_dir() { 0 } else { meta.len() },
                modified: modified_rfc3339(&meta),
                kind: kind.to_string(),
            });
        }
    }

    Ok(DirectorySnapshot {
        agent_id: agent_id.to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        directory: DirectoryInfo {
            files,
            total_files,
            total_size,
        },
    })
}

/// RFC 3339 modification time, empty when the filesystem has none.
fn modified_rfc3339(meta: &fs::Metadata) -> String {
    meta.modified()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_counts_files_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), vec![1u8; 10]).unwrap();
        fs::write(dir.path().join("sub/b.txt"), vec![2u8; 20]).unwrap();

        let snapshot = scan_shared_folder("agent-1", dir.path()).unwrap();
        assert_eq!(snapshot.agent_id, "agent-1");
        assert_eq!(snapshot.directory.total_files, 2);
        assert_eq!(snapshot.directory.total_size, 30);
        // Files plus the directory entry.
        assert_eq!(snapshot.directory.files.len(), 3);

        let sub_entry = snapshot
            .directory
            .files
            .iter()
            .find(|f| f.path == "sub")
            .unwrap();
        assert_eq!(sub_entry.kind, "directory");

        let nested = snapshot
            .directory
            .files
            .iter()
            .find(|f| f.path == "sub/b.txt")
            .unwrap();
        assert_eq!(nested.kind, "file");
        assert_eq!(nested.size, 20);
    }

    #[test]
    fn scan_of_empty_folder_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = scan_shared_folder("a", dir.path()).unwrap();
        assert_eq!(snapshot.directory.total_files, 0);
        assert!(snapshot.directory.files.is_empty());
    }

    #[test]
    fn timestamps_are_rfc3339() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();

        let snapshot = scan_shared_folder("a", dir.path()).unwrap();
        assert!(
            DateTime::parse_from_rfc3339(&snapshot.timestamp).is_ok(),
            "snapshot timestamp not RFC 3339: {}",
            snapshot.timestamp
        );
        let entry = &snapshot.directory.files[0];
        assert!(
            DateTime::parse_from_rfc3339(&entry.modified).is_ok(),
            "entry mtime not RFC 3339: {}",
            entry.modified
        );
    }
}
