// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! File metadata records and the POSIX permission check.

use crate::credentials::Credentials;
use crate::error::{ApiError, FsResult};

/// Mask selecting the file-type bits (top 4 bits of the mode word).
pub const S_IFMT: u32 = 0xF000;

/// File type encoded in the top 4 mode bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    File = 0x8000,
    Directory = 0x4000,
    Symlink = 0xA000,
}

impl FileType {
    pub fn from_mode(mode: u32) -> Option<FileType> {
        match mode & S_IFMT {
            0x8000 => Some(FileType::File),
            0x4000 => Some(FileType::Directory),
            0xA000 => Some(FileType::Symlink),
            _ => None,
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }
}

/// File metadata as surfaced by `stat` and carried by open file handles.
///
/// `dev`, `ino`, and `rdev` are always 0, `nlink` is always 1, and the
/// block accounting is derived from `size`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Stats {
    pub size: u32,
    pub mode: u32,
    pub atime_ms: f64,
    pub mtime_ms: f64,
    pub ctime_ms: f64,
    pub birthtime_ms: f64,
    pub uid: u32,
    pub gid: u32,
}

/// Milliseconds since the epoch, the timestamp unit of every record here.
pub fn now_ms() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as f64
}

impl Stats {
    /// Byte length of the fixed little-endian wire form.
    pub const SERIALIZED_LEN: usize = 40;

    pub fn new(file_type: FileType, size: u32, mode: u32) -> Self {
        let now = now_ms();
        Self::with_times(file_type, size, mode, now, now, now, now)
    }

    pub fn with_times(
        file_type: FileType,
        size: u32,
        mode: u32,
        atime_ms: f64,
        mtime_ms: f64,
        ctime_ms: f64,
        birthtime_ms: f64,
    ) -> Self {
        Self {
            size,
            mode: (mode & !S_IFMT) | file_type.bits(),
            atime_ms,
            mtime_ms,
            ctime_ms,
            birthtime_ms,
            uid: 0,
            gid: 0,
        }
    }

    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == FileType::File.bits()
    }

    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == FileType::Directory.bits()
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == FileType::Symlink.bits()
    }

    pub const fn nlink(&self) -> u32 {
        1
    }

    pub const fn blksize(&self) -> u32 {
        4096
    }

    /// Number of 512-byte blocks the file occupies.
    pub fn blocks(&self) -> u32 {
        (self.size + 511) / 512
    }

    pub const fn dev(&self) -> u32 {
        0
    }

    pub const fn ino(&self) -> u32 {
        0
    }

    pub const fn rdev(&self) -> u32 {
        0
    }

    /// Replace the permission bits, preserving the file-type bits.
    pub fn chmod(&mut self, mode: u32) {
        self.mode = (self.mode & S_IFMT) | (mode & 0o7777);
    }

    pub fn chown(&mut self, uid: u32, gid: u32) {
        self.uid = uid;
        self.gid = gid;
    }

    /// POSIX rwx check for the requested bits (0o4 read, 0o2 write,
    /// 0o1 execute) against the effective ids of `cred`.
    pub fn has_access(&self, want: u32, cred: &Credentials) -> bool {
        if cred.euid == 0 || cred.egid == 0 {
            return true;
        }
        let granted = if cred.euid == self.uid {
            (self.mode >> 6) & 0o7
        } else if cred.egid == self.gid {
            (self.mode >> 3) & 0o7
        } else {
            self.mode & 0o7
        };
        (want & granted) == want
    }

    /// Fixed little-endian wire form:
    /// `u32 size | u32 mode | f64 atime | f64 mtime | f64 ctime | u32 uid | u32 gid`.
    pub fn serialize(&self) -> [u8; Self::SERIALIZED_LEN] {
        let mut buf = [0u8; Self::SERIALIZED_LEN];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.mode.to_le_bytes());
        buf[8..16].copy_from_slice(&self.atime_ms.to_le_bytes());
        buf[16..24].copy_from_slice(&self.mtime_ms.to_le_bytes());
        buf[24..32].copy_from_slice(&self.ctime_ms.to_le_bytes());
        buf[32..36].copy_from_slice(&self.uid.to_le_bytes());
        buf[36..40].copy_from_slice(&self.gid.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> FsResult<Self> {
        if data.len() < Self::SERIALIZED_LEN {
            return Err(ApiError::io("truncated stats record"));
        }
        let read_u32 = |off: usize| u32::from_le_bytes(data[off..off + 4].try_into().unwrap());
        let read_f64 = |off: usize| f64::from_le_bytes(data[off..off + 8].try_into().unwrap());
        let ctime_ms = read_f64(24);
        Ok(Self {
            size: read_u32(0),
            mode: read_u32(4),
            atime_ms: read_f64(8),
            mtime_ms: read_f64(16),
            ctime_ms,
            birthtime_ms: ctime_ms,
            uid: read_u32(32),
            gid: read_u32(36),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_bits() {
        let s = Stats::new(FileType::Directory, 0, 0o755);
        assert!(s.is_directory());
        assert!(!s.is_file());
        assert_eq!(s.mode & 0o777, 0o755);
    }

    #[test]
    fn test_chmod_preserves_type() {
        let mut s = Stats::new(FileType::File, 10, 0o644);
        s.chmod(0o600);
        assert!(s.is_file());
        assert_eq!(s.mode & 0o777, 0o600);
    }

    #[test]
    fn test_block_accounting() {
        let s = Stats::new(FileType::File, 1025, 0o644);
        assert_eq!(s.blksize(), 4096);
        assert_eq!(s.blocks(), 3);
        assert_eq!(Stats::new(FileType::File, 0, 0o644).blocks(), 0);
    }

    #[test]
    fn test_has_access() {
        let mut s = Stats::new(FileType::File, 0, 0o640);
        s.chown(1000, 100);

        let owner = Credentials::new(1000, 1000);
        assert!(s.has_access(0o4, &owner));
        assert!(s.has_access(0o2, &owner));
        assert!(!s.has_access(0o1, &owner));

        let group = Credentials::new(2000, 100);
        assert!(s.has_access(0o4, &group));
        assert!(!s.has_access(0o2, &group));

        let other = Credentials::new(3000, 3000);
        assert!(!s.has_access(0o4, &other));

        assert!(s.has_access(0o7, &Credentials::ROOT));
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut s = Stats::new(FileType::File, 512, 0o644);
        s.chown(42, 7);
        let bytes = s.serialize();
        let back = Stats::deserialize(&bytes).unwrap();
        assert_eq!(back.size, s.size);
        assert_eq!(back.mode, s.mode);
        assert_eq!(back.uid, 42);
        assert_eq!(back.gid, 7);
        assert_eq!(back.mtime_ms, s.mtime_ms);
    }

    #[test]
    fn test_deserialize_short_buffer() {
        assert!(Stats::deserialize(&[0u8; 10]).is_err());
    }
}
