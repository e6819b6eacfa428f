//! Byte copy from a source file into a staging file on the destination drive.

use crate::command::{args, CommandRunner};
use crate::config::MigrationConfig;
use crate::{Result, TierError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// Which [`CopyPrimitive`] the executor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopierKind {
    #[default]
    Native,
    Rsync,
}

impl CopierKind {
    pub fn build(self, runner: CommandRunner) -> std::sync::Arc<dyn CopyPrimitive> {
        match self {
            CopierKind::Native => std::sync::Arc::new(NativeCopier::new()),
            CopierKind::Rsync => std::sync::Arc::new(RsyncCopier::new(runner)),
        }
    }
}

/// Copies `src` to `dst`, returning the bytes now in `dst`.
///
/// An existing `dst` is a partial earlier copy; implementations may resume
/// from it. Integrity is checked by the caller, not here.
#[async_trait]
pub trait CopyPrimitive: Send + Sync {
    async fn copy(&self, src: &Path, dst: &Path) -> Result<u64>;
}

/// Chunked in-process copy on the blocking pool.
#[derive(Debug, Clone, Copy)]
pub struct NativeCopier {
    chunk_size: usize,
}

impl Default for NativeCopier {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeCopier {
    pub fn new() -> Self {
        Self {
            chunk_size: MigrationConfig::COPY_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl CopyPrimitive for NativeCopier {
    async fn copy(&self, src: &Path, dst: &Path) -> Result<u64> {
        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        let chunk_size = self.chunk_size;
        tokio::task::spawn_blocking(move || copy_file(&src, &dst, chunk_size))
            .await
            .map_err(|e| TierError::Other(format!("Copy task failed: {}", e)))?
    }
}

/// Whether the first `len` bytes of `src` and `dst` are equal.
fn prefix_matches(src: &Path, dst: &Path, len: u64, chunk_size: usize) -> Result<bool> {
    let mut a = File::open(src).map_err(|e| TierError::io_with_path(e, src))?;
    let mut b = match File::open(dst) {
        Ok(file) => file,
        Err(_) => return Ok(false),
    };
    let mut left = vec![0u8; chunk_size];
    let mut right = vec![0u8; chunk_size];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(chunk_size as u64) as usize;
        a.read_exact(&mut left[..n])
            .map_err(|e| TierError::io_with_path(e, src))?;
        if b.read_exact(&mut right[..n]).is_err() || left[..n] != right[..n] {
            return Ok(false);
        }
        remaining -= n as u64;
    }
    Ok(true)
}

/// Blocking copy that appends to a partial `dst` holding a prefix of the
/// source and restarts any other. Permissions and mtime follow the source.
fn copy_file(src: &Path, dst: &Path, chunk_size: usize) -> Result<u64> {
    let mut input = File::open(src).map_err(|e| TierError::io_with_path(e, src))?;
    let meta = input.metadata().map_err(|e| TierError::io_with_path(e, src))?;
    let total = meta.len();

    let existing = std::fs::metadata(dst).map(|m| m.len()).unwrap_or(0);
    let resumable = existing > 0
        && existing <= total
        && prefix_matches(src, dst, existing, chunk_size)?;
    let resume_from = if resumable {
        existing
    } else {
        0
    };

    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(dst)
        .map_err(|e| TierError::io_with_path(e, dst))?;
    output
        .set_len(resume_from)
        .map_err(|e| TierError::io_with_path(e, dst))?;
    if resume_from > 0 {
        debug!(
            "Resuming copy of {} at byte {} of {}",
            src.display(),
            resume_from,
            total
        );
    }
    input
        .seek(SeekFrom::Start(resume_from))
        .map_err(|e| TierError::io_with_path(e, src))?;
    output
        .seek(SeekFrom::Start(resume_from))
        .map_err(|e| TierError::io_with_path(e, dst))?;

    let mut buffer = vec![0u8; chunk_size];
    let mut written = resume_from;
    loop {
        let n = input
            .read(&mut buffer)
            .map_err(|e| TierError::io_with_path(e, src))?;
        if n == 0 {
            break;
        }
        output
            .write_all(&buffer[..n])
            .map_err(|e| TierError::io_with_path(e, dst))?;
        written += n as u64;
    }

    output
        .set_permissions(meta.permissions())
        .map_err(|e| TierError::io_with_path(e, dst))?;
    if let Ok(modified) = meta.modified() {
        output
            .set_modified(modified)
            .map_err(|e| TierError::io_with_path(e, dst))?;
    }
    output
        .sync_all()
        .map_err(|e| TierError::io_with_path(e, dst))?;

    Ok(written)
}

/// Delegates to `rsync`, which keeps hard links, ACLs and xattrs.
#[derive(Debug, Clone)]
pub struct RsyncCopier {
    runner: CommandRunner,
}

impl RsyncCopier {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl CopyPrimitive for RsyncCopier {
    async fn copy(&self, src: &Path, dst: &Path) -> Result<u64> {
        let src_str = src.to_string_lossy().to_string();
        let dst_str = dst.to_string_lossy().to_string();
        self.runner
            .run(
                "rsync",
                &args(["-aHAXS", "--partial", "--inplace", &src_str, &dst_str]),
            )
            .await?;

        // Nothing was written in dry-run; report the source size.
        let measured = if self.runner.is_dry_run() { src } else { dst };
        let meta = tokio::fs::metadata(measured)
            .await
            .map_err(|e| TierError::io_with_path(e, measured))?;
        Ok(meta.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_native_copy_preserves_content_and_mtime() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.bin");
        let dst = temp.path().join("dst.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        File::options()
            .write(true)
            .open(&src)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let copied = NativeCopier::with_chunk_size(1024)
            .copy(&src, &dst)
            .await
            .unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(std::fs::read(&dst).unwrap(), data);
        assert_eq!(std::fs::metadata(&dst).unwrap().modified().unwrap(), mtime);
    }

    #[tokio::test]
    async fn test_native_copy_resumes_partial() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.bin");
        let dst = temp.path().join("dst.bin");
        std::fs::write(&src, b"hello world").unwrap();
        std::fs::write(&dst, b"hello").unwrap();

        let copied = NativeCopier::new().copy(&src, &dst).await.unwrap();
        assert_eq!(copied, 11);
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_native_copy_restarts_mismatched_partial() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.bin");
        let dst = temp.path().join("dst.bin");
        std::fs::write(&src, b"hello world").unwrap();
        std::fs::write(&dst, b"jello").unwrap();

        let copied = NativeCopier::with_chunk_size(2).copy(&src, &dst).await.unwrap();
        assert_eq!(copied, 11);
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_native_copy_restarts_oversized_partial() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.bin");
        let dst = temp.path().join("dst.bin");
        std::fs::write(&src, b"short").unwrap();
        std::fs::write(&dst, b"something much longer").unwrap();

        NativeCopier::new().copy(&src, &dst).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"short");
    }

    #[tokio::test]
    async fn test_missing_source_is_not_found() {
        let temp = TempDir::new().unwrap();
        let err = NativeCopier::new()
            .copy(&temp.path().join("nope"), &temp.path().join("dst"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rsync_dry_run_reports_source_size() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.bin");
        std::fs::write(&src, b"12345").unwrap();

        let copier = RsyncCopier::new(CommandRunner::new(true));
        let copied = copier.copy(&src, &temp.path().join("dst")).await.unwrap();
        assert_eq!(copied, 5);
        assert!(!temp.path().join("dst").exists());
    }
}
