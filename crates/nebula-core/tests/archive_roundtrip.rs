//! Archive-then-extract round trip across a realistic tree.

use std::fs;

use nebula_core::archive::{extract_archive, stream_path};

#[tokio::test]
async fn directory_round_trip_preserves_tree_and_contents() {
    let src = tempfile::tempdir().unwrap();
    fs::create_dir_all(src.path().join("docs/notes")).unwrap();
    fs::write(src.path().join("docs/readme.md"), b"# readme\n").unwrap();
    fs::write(src.path().join("docs/notes/a.txt"), vec![3u8; 70_000]).unwrap();
    fs::write(src.path().join("root.bin"), vec![9u8; 200_000]).unwrap();
    fs::create_dir(src.path().join("empty")).unwrap();

    // Produce the chunked archive.
    let mut stream = stream_path(src.path().to_path_buf());
    let mut archive_bytes = Vec::new();
    while let Some(chunk) = stream.data.recv().await {
        archive_bytes.extend_from_slice(&chunk);
    }
    assert!(stream.errors.recv().await.is_none());

    // Receiver writes the chunks to a temp file, then extracts.
    let work = tempfile::tempdir().unwrap();
    let tar_path = work.path().join("transfer.tar");
    fs::write(&tar_path, &archive_bytes).unwrap();

    let out_root = work.path().join("transfers").join("agent-src");
    let summary = extract_archive(&tar_path, &out_root).unwrap();
    assert_eq!(summary.files, 3);
    assert_eq!(summary.skipped, 0);

    assert_eq!(
        fs::read(out_root.join("docs/readme.md")).unwrap(),
        b"# readme\n"
    );
    assert_eq!(
        fs::read(out_root.join("docs/notes/a.txt")).unwrap(),
        vec![3u8; 70_000]
    );
    assert_eq!(fs::read(out_root.join("root.bin")).unwrap(), vec![9u8; 200_000]);
    assert!(out_root.join("empty").is_dir());
}

#[cfg(unix)]
#[tokio::test]
async fn round_trip_preserves_file_modes() {
    use std::os::unix::fs::PermissionsExt;

    let src = tempfile::tempdir().unwrap();
    let script = src.path().join("run.sh");
    fs::write(&script, b"#!/bin/sh\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let mut stream = stream_path(src.path().to_path_buf());
    let mut archive_bytes = Vec::new();
    while let Some(chunk) = stream.data.recv().await {
        archive_bytes.extend_from_slice(&chunk);
    }

    let work = tempfile::tempdir().unwrap();
    let tar_path = work.path().join("transfer.tar");
    fs::write(&tar_path, &archive_bytes).unwrap();

    let out_root = work.path().join("out");
    extract_archive(&tar_path, &out_root).unwrap();

    let mode = fs::metadata(out_root.join("run.sh"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o755);
}
