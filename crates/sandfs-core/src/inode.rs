// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The metadata record stored per filesystem entity in the key-value
//! engines. Each inode lives under its own store key and points at a
//! companion data blob keyed by `inode.id` (file bytes, or the JSON
//! directory listing).

use crate::error::{ApiError, FsResult};
use crate::stats::{FileType, Stats, S_IFMT};

/// Store key of the root directory's inode.
pub const ROOT_NODE_ID: &str = "/";

#[derive(Clone, Debug, PartialEq)]
pub struct Inode {
    /// Store key of the companion data blob.
    pub id: String,
    pub size: u32,
    pub mode: u16,
    pub atime_ms: f64,
    pub mtime_ms: f64,
    pub ctime_ms: f64,
    pub uid: u32,
    pub gid: u32,
}

/// Fixed prefix length of the wire form; the utf-8 id follows.
const FIXED_LEN: usize = 38;

impl Inode {
    pub fn new(id: String, size: u32, mode: u16, uid: u32, gid: u32) -> Self {
        let now = crate::stats::now_ms();
        Self {
            id,
            size,
            mode,
            atime_ms: now,
            mtime_ms: now,
            ctime_ms: now,
            uid,
            gid,
        }
    }

    pub fn is_file(&self) -> bool {
        (self.mode as u32) & S_IFMT == FileType::File.bits()
    }

    pub fn is_directory(&self) -> bool {
        (self.mode as u32) & S_IFMT == FileType::Directory.bits()
    }

    pub fn to_stats(&self) -> Stats {
        let file_type = FileType::from_mode(self.mode as u32).unwrap_or(FileType::File);
        let mut stats = Stats::with_times(
            file_type,
            self.size,
            self.mode as u32,
            self.atime_ms,
            self.mtime_ms,
            self.ctime_ms,
            self.ctime_ms,
        );
        stats.chown(self.uid, self.gid);
        stats
    }

    /// Pull size, mode, ownership, and timestamps from `stats`, reporting
    /// whether anything changed so callers can skip the metadata write.
    pub fn update(&mut self, stats: &Stats) -> bool {
        let mut changed = false;
        if self.size != stats.size {
            self.size = stats.size;
            changed = true;
        }
        if self.mode as u32 != stats.mode {
            self.mode = stats.mode as u16;
            changed = true;
        }
        if self.atime_ms != stats.atime_ms {
            self.atime_ms = stats.atime_ms;
            changed = true;
        }
        if self.mtime_ms != stats.mtime_ms {
            self.mtime_ms = stats.mtime_ms;
            changed = true;
        }
        if self.ctime_ms != stats.ctime_ms {
            self.ctime_ms = stats.ctime_ms;
            changed = true;
        }
        if self.uid != stats.uid {
            self.uid = stats.uid;
            changed = true;
        }
        if self.gid != stats.gid {
            self.gid = stats.gid;
            changed = true;
        }
        changed
    }

    /// Wire form: 38 fixed little-endian bytes
    /// (`u32 size | u16 mode | f64 atime | f64 mtime | f64 ctime | u32 uid | u32 gid`)
    /// followed by the utf-8 id.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_LEN + self.id.len());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.atime_ms.to_le_bytes());
        buf.extend_from_slice(&self.mtime_ms.to_le_bytes());
        buf.extend_from_slice(&self.ctime_ms.to_le_bytes());
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.gid.to_le_bytes());
        buf.extend_from_slice(self.id.as_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> FsResult<Self> {
        if data.len() < FIXED_LEN {
            return Err(ApiError::io("truncated inode record"));
        }
        let read_u32 = |off: usize| u32::from_le_bytes(data[off..off + 4].try_into().unwrap());
        let read_f64 = |off: usize| f64::from_le_bytes(data[off..off + 8].try_into().unwrap());
        let id = std::str::from_utf8(&data[FIXED_LEN..])
            .map_err(|_| ApiError::io("inode id is not utf-8"))?
            .to_string();
        Ok(Self {
            id,
            size: read_u32(0),
            mode: u16::from_le_bytes([data[4], data[5]]),
            atime_ms: read_f64(6),
            mtime_ms: read_f64(14),
            ctime_ms: read_f64(22),
            uid: read_u32(30),
            gid: read_u32(34),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Inode {
        Inode::new(
            "0452b8e5-890c-4b2a-9e83-28a27b1b07d7".to_string(),
            4096,
            (FileType::File.bits() | 0o644) as u16,
            1000,
            1000,
        )
    }

    #[test]
    fn test_serialize_round_trip() {
        let inode = sample();
        let bytes = inode.serialize();
        assert_eq!(bytes.len(), 38 + inode.id.len());
        let back = Inode::deserialize(&bytes).unwrap();
        assert_eq!(back, inode);
    }

    #[test]
    fn test_to_stats_extracts_type() {
        let inode = sample();
        let stats = inode.to_stats();
        assert!(stats.is_file());
        assert_eq!(stats.size, 4096);
        assert_eq!(stats.uid, 1000);
    }

    #[test]
    fn test_update_reports_change() {
        let mut inode = sample();
        let mut stats = inode.to_stats();
        assert!(!inode.update(&stats));

        stats.size = 9000;
        stats.chown(0, 5);
        assert!(inode.update(&stats));
        assert_eq!(inode.size, 9000);
        assert_eq!(inode.uid, 0);
        assert_eq!(inode.gid, 5);
    }

    #[test]
    fn test_deserialize_rejects_short_input() {
        assert!(Inode::deserialize(&[0u8; 37]).is_err());
    }
}
