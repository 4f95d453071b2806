//! Where completed inbound files go

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::transfer::ReceivedFile;

/// The "deliver completed file" collaborator.
/// Returns a human-readable location for status output.
#[async_trait]
pub trait FileSink: Send + Sync {
    async fn deliver(&self, file: ReceivedFile) -> Result<String>;
}

/// Saves received files into a directory
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Strip directory components from a remote-supplied name
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .find(|part| !part.is_empty())
        .unwrap_or("");
    match base {
        "" | "." | ".." => "received.bin".to_string(),
        other => other.to_string(),
    }
}

/// Find an available filename by appending _2, _3, etc.
pub fn find_available_filename(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().unwrap_or(Path::new("."));

    let mut i = 2u64;
    loop {
        let candidate = parent.join(format!("{}_{}{}", stem, i, ext));
        if !candidate.exists() {
            return candidate;
        }
        i += 1;
    }
}

#[async_trait]
impl FileSink for DirectorySink {
    async fn deliver(&self, file: ReceivedFile) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let target = find_available_filename(&self.dir.join(sanitize_filename(&file.metadata.name)));
        tokio::fs::write(&target, &file.data)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;
        log::info!("Saved {} bytes to {}", file.data.len(), target.display());
        Ok(target.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferMetadata;
    use bytes::Bytes;

    fn received(name: &str, data: &'static [u8]) -> ReceivedFile {
        ReceivedFile {
            metadata: TransferMetadata {
                name: name.to_string(),
                size: data.len() as u64,
                mime_type: "text/plain".to_string(),
            },
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\a.txt"), "a.txt");
        assert_eq!(sanitize_filename("dir/"), "dir");
        assert_eq!(sanitize_filename(".."), "received.bin");
        assert_eq!(sanitize_filename(""), "received.bin");
    }

    #[tokio::test]
    async fn test_deliver_avoids_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());

        let first = sink.deliver(received("a.txt", b"one")).await.unwrap();
        let second = sink.deliver(received("a.txt", b"two")).await.unwrap();

        assert!(first.ends_with("a.txt"));
        assert!(second.ends_with("a_2.txt"));
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"one");
        assert_eq!(std::fs::read(dir.path().join("a_2.txt")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_deliver_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("nested"));
        sink.deliver(received("empty.bin", b"")).await.unwrap();
        let meta = std::fs::metadata(dir.path().join("nested").join("empty.bin")).unwrap();
        assert_eq!(meta.len(), 0);
    }
}
