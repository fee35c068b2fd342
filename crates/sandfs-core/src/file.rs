// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open file handles.
//!
//! Backends hand out implementations of [`File`]. The buffered handles in
//! this tree are all built on [`PreloadFile`], which keeps the whole file
//! in memory and tracks dirtiness; the backend-specific part is only how
//! `sync` persists the buffer.

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::{ApiError, FsResult};
use crate::flag::FileFlag;
use crate::stats::{now_ms, Stats};

/// An open file. Reads and writes mutate an in-memory image; `sync`
/// pushes the image to the owning backend and `close` implies `sync`.
#[async_trait]
pub trait File: Send + Sync {
    fn path(&self) -> &str;
    fn flag(&self) -> FileFlag;

    /// Metadata of the open handle (not a fresh backend probe).
    fn stat(&self) -> FsResult<Stats>;

    fn get_pos(&self) -> u64;

    fn read(
        &mut self,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> FsResult<usize>;

    async fn write(
        &mut self,
        data: &[u8],
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> FsResult<usize>;

    fn write_sync(
        &mut self,
        data: &[u8],
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> FsResult<usize>;

    async fn truncate(&mut self, len: u64) -> FsResult<()>;
    fn truncate_sync(&mut self, len: u64) -> FsResult<()>;

    async fn sync(&mut self) -> FsResult<()>;
    fn sync_sync(&mut self) -> FsResult<()>;

    async fn close(&mut self) -> FsResult<()> {
        self.sync().await
    }

    fn close_sync(&mut self) -> FsResult<()> {
        self.sync_sync()
    }

    async fn chmod(&mut self, mode: u32) -> FsResult<()>;
    fn chmod_sync(&mut self, mode: u32) -> FsResult<()>;

    async fn chown(&mut self, uid: u32, gid: u32) -> FsResult<()>;
    fn chown_sync(&mut self, uid: u32, gid: u32) -> FsResult<()>;

    async fn utimes(&mut self, atime_ms: f64, mtime_ms: f64) -> FsResult<()>;
    fn utimes_sync(&mut self, atime_ms: f64, mtime_ms: f64) -> FsResult<()>;
}

/// Outcome of a buffered write: either the bytes were buffered, or the
/// flag is synchronous and the caller must persist now, then report the
/// total buffer length (a quirk of the original engine, kept on purpose).
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Buffered(usize),
    NeedsSync(usize),
}

/// The shared in-memory image of an open file: path, flag, a stats
/// snapshot, the byte buffer, the cursor, and a dirty bit.
#[derive(Debug)]
pub struct PreloadFile {
    path: String,
    flag: FileFlag,
    stat: Stats,
    buffer: Vec<u8>,
    pos: u64,
    dirty: bool,
}

impl PreloadFile {
    /// A readable flag requires the buffer to match `stat.size`; writable
    /// modes may diverge and drive a resize on first write.
    pub fn new(path: String, flag: FileFlag, stat: Stats, buffer: Vec<u8>) -> FsResult<Self> {
        if flag.is_readable() && stat.size as usize != buffer.len() {
            return Err(ApiError::io(format!(
                "stat size {} does not match buffer length {} for '{}'",
                stat.size,
                buffer.len(),
                path
            )));
        }
        Ok(Self {
            path,
            flag,
            stat,
            buffer,
            pos: 0,
            dirty: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: String) {
        self.path = path;
    }

    pub fn flag(&self) -> FileFlag {
        self.flag
    }

    pub fn stat(&self) -> &Stats {
        &self.stat
    }

    pub fn stat_mut(&mut self) -> &mut Stats {
        &mut self.stat
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Appendable flags ignore the cursor; the effective position is the
    /// current end of file.
    pub fn get_pos(&self) -> u64 {
        if self.flag.is_appendable() {
            self.stat.size as u64
        } else {
            self.pos
        }
    }

    pub fn read_at(
        &mut self,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> FsResult<usize> {
        if !self.flag.is_readable() {
            return Err(ApiError::with_path(
                crate::error::ErrorCode::EPERM,
                "file not opened for reading",
                self.path.clone(),
            ));
        }
        let position = position.unwrap_or_else(|| self.get_pos()) as usize;
        let mut length = length.min(buf.len().saturating_sub(offset));
        if position + length > self.stat.size as usize {
            length = (self.stat.size as usize).saturating_sub(position);
        }
        if length > 0 {
            buf[offset..offset + length]
                .copy_from_slice(&self.buffer[position..position + length]);
        }
        self.stat.atime_ms = now_ms();
        self.pos = (position + length) as u64;
        Ok(length)
    }

    pub fn write_at(
        &mut self,
        data: &[u8],
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> FsResult<WriteOutcome> {
        if !self.flag.is_writable() {
            return Err(ApiError::with_path(
                crate::error::ErrorCode::EPERM,
                "file not opened for writing",
                self.path.clone(),
            ));
        }
        if offset + length > data.len() {
            return Err(ApiError::invalid_argument(
                "write range exceeds source buffer",
            ));
        }
        let position = position.unwrap_or_else(|| self.get_pos()) as usize;
        let end = position + length;
        if end > self.stat.size as usize {
            self.stat.size = end as u32;
            if end > self.buffer.len() {
                self.buffer.resize(end, 0);
            }
        }
        self.buffer[position..end].copy_from_slice(&data[offset..offset + length]);
        self.stat.mtime_ms = now_ms();
        self.dirty = true;
        if self.flag.is_synchronous() {
            Ok(WriteOutcome::NeedsSync(self.buffer.len()))
        } else {
            self.pos = end as u64;
            Ok(WriteOutcome::Buffered(length))
        }
    }

    /// Shrink in place, or grow by writing zeroes through [`write_at`].
    /// Returns whether the flag is synchronous and the caller must
    /// persist now.
    pub fn truncate_to(&mut self, len: u64) -> FsResult<bool> {
        if !self.flag.is_writable() {
            return Err(ApiError::with_path(
                crate::error::ErrorCode::EPERM,
                "file not opened for writing",
                self.path.clone(),
            ));
        }
        self.dirty = true;
        let len = len as usize;
        if len > self.stat.size as usize {
            let zeros = vec![0u8; len - self.stat.size as usize];
            let grow_at = self.stat.size as u64;
            self.write_at(&zeros, 0, zeros.len(), Some(grow_at))?;
        } else {
            self.buffer.truncate(len);
            self.stat.size = len as u32;
            self.stat.mtime_ms = now_ms();
        }
        Ok(self.flag.is_synchronous())
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.dirty = true;
        self.stat.chmod(mode);
        self.stat.ctime_ms = now_ms();
    }

    pub fn set_owner(&mut self, uid: u32, gid: u32) {
        self.dirty = true;
        self.stat.chown(uid, gid);
        self.stat.ctime_ms = now_ms();
    }

    pub fn set_times(&mut self, atime_ms: f64, mtime_ms: f64) {
        self.dirty = true;
        self.stat.atime_ms = atime_ms;
        self.stat.mtime_ms = mtime_ms;
    }
}

/// Verify that `cred` may open a file whose metadata is `stats` with
/// `flag`; shared by the keyed engines and the overlay.
pub fn check_open_access(
    path: &str,
    stats: &Stats,
    flag: FileFlag,
    cred: &Credentials,
) -> FsResult<()> {
    if !stats.has_access(flag.access_mode(), cred) {
        return Err(ApiError::access_denied(path));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::FileType;

    fn file(flag: &str, content: &[u8]) -> PreloadFile {
        let stat = Stats::new(FileType::File, content.len() as u32, 0o644);
        PreloadFile::new(
            "/f".to_string(),
            FileFlag::parse(flag).unwrap(),
            stat,
            content.to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn test_readable_requires_matching_size() {
        let stat = Stats::new(FileType::File, 10, 0o644);
        assert!(PreloadFile::new("/f".into(), FileFlag::R, stat, vec![0; 3]).is_err());
    }

    #[test]
    fn test_read_clamps_and_advances() {
        let mut f = file("r", b"hello world");
        let mut buf = [0u8; 64];
        let n = f.read_at(&mut buf, 0, 64, Some(6)).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"world");
        assert_eq!(f.get_pos(), 11);
    }

    #[test]
    fn test_read_requires_readable() {
        let mut f = file("a", b"");
        let mut buf = [0u8; 4];
        assert!(f.read_at(&mut buf, 0, 4, None).is_err());
    }

    #[test]
    fn test_write_grows_buffer() {
        let mut f = file("r+", b"abc");
        let outcome = f.write_at(b"XYZ12", 0, 5, Some(2)).unwrap();
        assert_eq!(outcome, WriteOutcome::Buffered(5));
        assert_eq!(f.buffer(), b"abXYZ12");
        assert_eq!(f.stat().size, 7);
        assert!(f.is_dirty());
        assert_eq!(f.get_pos(), 7);
    }

    #[test]
    fn test_synchronous_write_reports_total_length() {
        let mut f = file("rs+", b"abcd");
        let outcome = f.write_at(b"Z", 0, 1, Some(0)).unwrap();
        assert_eq!(outcome, WriteOutcome::NeedsSync(4));
    }

    #[test]
    fn test_append_ignores_position_cursor() {
        let mut f = file("a+", b"ab");
        assert_eq!(f.get_pos(), 2);
        f.write_at(b"cd", 0, 2, None).unwrap();
        assert_eq!(f.buffer(), b"abcd");
    }

    #[test]
    fn test_truncate_shrinks() {
        let mut f = file("r+", b"abcdef");
        f.truncate_to(3).unwrap();
        assert_eq!(f.buffer(), b"abc");
        assert_eq!(f.stat().size, 3);
    }

    #[test]
    fn test_truncate_grows_with_zeroes() {
        let mut f = file("r+", b"ab");
        f.truncate_to(4).unwrap();
        assert_eq!(f.buffer(), b"ab\0\0");
        assert_eq!(f.stat().size, 4);
    }

    #[test]
    fn test_chmod_keeps_type() {
        let mut f = file("r+", b"x");
        f.set_mode(0o600);
        assert!(f.stat().is_file());
        assert_eq!(f.stat().mode & 0o777, 0o600);
    }
}
