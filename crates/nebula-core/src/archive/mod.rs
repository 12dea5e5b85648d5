//! Directory archive streaming and extraction.
//!
//! Outgoing transfers are POSIX tar archives produced lazily as 64 KiB
//! chunks; incoming archives are extracted under a per-source directory
//! with path-traversal protection. The master never opens an archive:
//! production happens on the sending agent, extraction on the receiver.

mod extract;
mod stream;

pub use extract::{ExtractSummary, extract_archive, sanitize_entry_name};
pub use stream::{ArchiveStream, stream_path};
