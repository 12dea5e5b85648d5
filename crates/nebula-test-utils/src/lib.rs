//! Shared test fixtures for NebulaLink crates.
//!
//! Small deterministic stand-ins for the trait seams: a fixed metrics
//! sampler, a capturing frame sender, and a shared-folder tree builder.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nebula_core::protocol::{HostMetrics, Outbound};

/// Metrics sampler returning the same snapshot every time.
pub struct FixedSampler {
    pub metrics: HostMetrics,
}

impl Default for FixedSampler {
    fn default() -> Self {
        Self {
            metrics: HostMetrics {
                cpu_usage: 12.5,
                memory_usage: 40.0,
                disk_usage: 55.0,
                hostname: "test-host".into(),
                os: "Linux".into(),
                uptime: 3600,
            },
        }
    }
}

// The sampler trait lives in nebula-agent; implementing it there would
// invert the dependency, so agent tests impl the trait over this struct's
// `sample_fixed` instead.
impl FixedSampler {
    pub fn sample_fixed(&self) -> HostMetrics {
        self.metrics.clone()
    }
}

/// Frame sender that records everything it is asked to deliver.
#[derive(Default)]
pub struct CapturingSender {
    sent: Mutex<Vec<(String, Outbound)>>,
}

impl CapturingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, agent_id: &str, out: Outbound) {
        self.sent
            .lock()
            .expect("capture lock poisoned")
            .push((agent_id.to_string(), out));
    }

    /// Snapshot of everything sent so far.
    pub fn sent(&self) -> Vec<(String, Outbound)> {
        self.sent.lock().expect("capture lock poisoned").clone()
    }

    /// Frames sent to one agent.
    pub fn sent_to(&self, agent_id: &str) -> Vec<Outbound> {
        self.sent()
            .into_iter()
            .filter(|(id, _)| id == agent_id)
            .map(|(_, out)| out)
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().expect("capture lock poisoned").clear();
    }
}

/// Build a small file tree under a temp dir for transfer tests.
///
/// `files` are (relative path, contents); parent directories are created
/// as needed. Returns the tempdir guard and its path.
pub fn build_tree(files: &[(&str, &[u8])]) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    for (rel, contents) in files {
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(&path, contents).expect("write");
    }
    let path = dir.path().to_path_buf();
    (dir, path)
}

/// Compare two directory trees byte-for-byte (files only).
pub fn trees_equal(a: &Path, b: &Path) -> bool {
    fn collect(root: &Path, base: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) {
        for entry in std::fs::read_dir(root).expect("read_dir") {
            let entry = entry.expect("entry");
            let path = entry.path();
            if path.is_dir() {
                collect(&path, base, out);
            } else {
                let rel = path.strip_prefix(base).expect("prefix").to_path_buf();
                out.push((rel, std::fs::read(&path).expect("read")));
            }
        }
    }
    let mut files_a = Vec::new();
    let mut files_b = Vec::new();
    collect(a, a, &mut files_a);
    collect(b, b, &mut files_b);
    files_a.sort();
    files_b.sort();
    files_a == files_b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_tree_and_compare() {
        let (_guard_a, a) = build_tree(&[("x/y.txt", b"hello"), ("z.bin", b"\x00\x01")]);
        let (_guard_b, b) = build_tree(&[("x/y.txt", b"hello"), ("z.bin", b"\x00\x01")]);
        let (_guard_c, c) = build_tree(&[("x/y.txt", b"different")]);

        assert!(trees_equal(&a, &b));
        assert!(!trees_equal(&a, &c));
    }

    #[test]
    fn capturing_sender_records_in_order() {
        use nebula_core::protocol::Frame;

        let sender = CapturingSender::new();
        sender.record("a1", Outbound::Frame(Frame::MasterMetricsRequest));
        sender.record("a2", Outbound::Frame(Frame::MasterRestartRequest));

        assert_eq!(sender.sent().len(), 2);
        assert_eq!(sender.sent_to("a1").len(), 1);
        sender.clear();
        assert!(sender.sent().is_empty());
    }
}
