//! Lazy chunked tar production.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::constants::ARCHIVE_CHUNK_SIZE;
use crate::error::Error;

/// Handle to a lazily produced archive.
///
/// `data` yields 64 KiB chunks until the archive (including the tar
/// end-of-archive marker) is fully emitted; `errors` carries at most one
/// producer error. A consumer sees either EOF on `data` or an error.
pub struct ArchiveStream {
    pub data: mpsc::Receiver<Bytes>,
    pub errors: mpsc::Receiver<Error>,
}

/// Start archiving the subtree rooted at (or containing) `path`.
///
/// If `path` is a directory, entries are stored relative to it; if it is a
/// file, the archive holds that single file under its basename. The walk
/// and tar encoding run on the blocking pool; chunks flow through a
/// bounded channel, so production keeps pace with the consumer.
pub fn stream_path(path: PathBuf) -> ArchiveStream {
    let (data_tx, data_rx) = mpsc::channel::<Bytes>(8);
    let (err_tx, err_rx) = mpsc::channel::<Error>(1);

    tokio::task::spawn_blocking(move || {
        if let Err(e) = produce(&path, data_tx) {
            // BrokenPipe means the consumer went away; not a producer fault.
            if e.kind() != io::ErrorKind::BrokenPipe {
                let _ = err_tx.blocking_send(Error::Archive {
                    message: e.to_string(),
                });
            }
        }
    });

    ArchiveStream {
        data: data_rx,
        errors: err_rx,
    }
}

fn produce(path: &Path, tx: mpsc::Sender<Bytes>) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    let mut builder = tar::Builder::new(ChunkSink::new(tx));

    if meta.is_dir() {
        append_dir_tree(&mut builder, path)?;
    } else if meta.is_file() {
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no basename"))?;
        append_file(&mut builder, path, Path::new(name), &meta)?;
    } else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "only regular files and directories can be archived",
        ));
    }

    let mut sink = builder.into_inner()?; // writes the end-of-archive marker
    sink.flush()?;
    Ok(())
}

/// Append every entry under `root`, directories before their children.
fn append_dir_tree(builder: &mut tar::Builder<ChunkSink>, root: &Path) -> io::Result<()> {
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries: Vec<_> = fs::read_dir(&dir)?.collect::<io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let entry_path = entry.path();
            let meta = fs::symlink_metadata(&entry_path)?;
            let rel = entry_path
                .strip_prefix(root)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry escaped root"))?
                .to_path_buf();

            if meta.is_dir() {
                append_dir(builder, &rel, &meta)?;
                stack.push(entry_path);
            } else if meta.is_file() {
                append_file(builder, &entry_path, &rel, &meta)?;
            } else {
                // Symlinks, devices, FIFOs are not carried.
                warn!(path = %entry_path.display(), "Skipping non-regular entry");
            }
        }
    }

    Ok(())
}

fn append_dir(
    builder: &mut tar::Builder<ChunkSink>,
    rel: &Path,
    meta: &fs::Metadata,
) -> io::Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(entry_mode(meta, 0o755));
    header.set_mtime(mtime_secs(meta));
    builder.append_data(&mut header, archive_name(rel), io::empty())
}

fn append_file(
    builder: &mut tar::Builder<ChunkSink>,
    src: &Path,
    rel: &Path,
    meta: &fs::Metadata,
) -> io::Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(meta.len());
    header.set_mode(entry_mode(meta, 0o644));
    header.set_mtime(mtime_secs(meta));
    let file = fs::File::open(src)?;
    builder.append_data(&mut header, archive_name(rel), file)
}

/// Archive entry names always use forward slashes.
fn archive_name(rel: &Path) -> PathBuf {
    PathBuf::from(rel.to_string_lossy().replace('\\', "/"))
}

#[cfg(unix)]
fn entry_mode(meta: &fs::Metadata, _default: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(_meta: &fs::Metadata, default: u32) -> u32 {
    default
}

fn mtime_secs(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `Write` adapter that regroups tar output into fixed-size chunks and
/// pushes them onto a bounded channel.
struct ChunkSink {
    tx: mpsc::Sender<Bytes>,
    buf: Vec<u8>,
}

impl ChunkSink {
    fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(ARCHIVE_CHUNK_SIZE * 2),
        }
    }

    fn send(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        self.tx
            .blocking_send(Bytes::from(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer gone"))
    }
}

impl Write for ChunkSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= ARCHIVE_CHUNK_SIZE {
            let rest = self.buf.split_off(ARCHIVE_CHUNK_SIZE);
            let chunk = std::mem::replace(&mut self.buf, rest);
            self.send(chunk)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let chunk = std::mem::take(&mut self.buf);
            self.send(chunk)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    async fn collect(mut stream: ArchiveStream) -> (Vec<u8>, Option<Error>) {
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.data.recv().await {
            bytes.extend_from_slice(&chunk);
        }
        (bytes, stream.errors.recv().await)
    }

    fn entry_names(tar_bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(tar_bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn directory_archive_lists_dirs_before_children() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.txt"), b"inner").unwrap();
        fs::write(dir.path().join("top.txt"), b"top").unwrap();

        let (bytes, err) = collect(stream_path(dir.path().to_path_buf())).await;
        assert!(err.is_none());

        let names = entry_names(&bytes);
        let sub = names.iter().position(|n| n == "sub").unwrap();
        let inner = names.iter().position(|n| n == "sub/inner.txt").unwrap();
        assert!(sub < inner);
        assert!(names.contains(&"top.txt".to_string()));
    }

    #[tokio::test]
    async fn single_file_archive_uses_basename() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("report.bin");
        fs::write(&file, vec![7u8; 1000]).unwrap();

        let (bytes, err) = collect(stream_path(file)).await;
        assert!(err.is_none());

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "report.bin");
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, vec![7u8; 1000]);
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn large_file_is_chunked() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big.bin"), vec![1u8; ARCHIVE_CHUNK_SIZE * 3]).unwrap();

        let mut stream = stream_path(dir.path().to_path_buf());
        let mut sizes = Vec::new();
        while let Some(chunk) = stream.data.recv().await {
            sizes.push(chunk.len());
        }
        assert!(sizes.len() > 1);
        // Every chunk except the last is exactly one chunk-size.
        for size in &sizes[..sizes.len() - 1] {
            assert_eq!(*size, ARCHIVE_CHUNK_SIZE);
        }
    }

    #[tokio::test]
    async fn missing_path_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let (bytes, err) = collect(stream_path(dir.path().join("no-such-dir"))).await;
        assert!(bytes.is_empty());
        assert!(matches!(err, Some(Error::Archive { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"data").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let (bytes, err) = collect(stream_path(dir.path().to_path_buf())).await;
        assert!(err.is_none());
        let names = entry_names(&bytes);
        assert!(names.contains(&"real.txt".to_string()));
        assert!(!names.contains(&"link.txt".to_string()));
    }
}
