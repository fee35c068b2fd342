// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open-mode flags and the action tables derived from them.

use crate::error::{ApiError, FsResult};

/// What `open` does when the path already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionType {
    Nop,
    ThrowException,
    TruncateFile,
    CreateFile,
}

/// A parsed open flag. The twelve valid string forms are
/// `r, r+, rs, rs+, w, wx, w+, wx+, a, ax, a+, ax+`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileFlag {
    R,
    RPlus,
    RSync,
    RSyncPlus,
    W,
    WExcl,
    WPlus,
    WExclPlus,
    A,
    AExcl,
    APlus,
    AExclPlus,
}

use FileFlag::*;

const ALL_FLAGS: [FileFlag; 12] = [
    R, RPlus, RSync, RSyncPlus, W, WExcl, WPlus, WExclPlus, A, AExcl, APlus, AExclPlus,
];

impl FileFlag {
    pub fn parse(s: &str) -> FsResult<FileFlag> {
        match s {
            "r" => Ok(R),
            "r+" => Ok(RPlus),
            "rs" => Ok(RSync),
            "rs+" => Ok(RSyncPlus),
            "w" => Ok(W),
            "wx" => Ok(WExcl),
            "w+" => Ok(WPlus),
            "wx+" => Ok(WExclPlus),
            "a" => Ok(A),
            "ax" => Ok(AExcl),
            "a+" => Ok(APlus),
            "ax+" => Ok(AExclPlus),
            _ => Err(ApiError::invalid_argument(format!(
                "invalid flag string: '{}'",
                s
            ))),
        }
    }

    /// Map a numeric POSIX flag word to its string form. Bits outside the
    /// access mode and CREAT/TRUNC/APPEND/EXCL/SYNC are ignored.
    pub fn from_number(flags: u32) -> FsResult<FileFlag> {
        let known = (libc::O_ACCMODE
            | libc::O_CREAT
            | libc::O_TRUNC
            | libc::O_APPEND
            | libc::O_EXCL
            | libc::O_SYNC) as u32;
        let masked = flags & known;
        for flag in ALL_FLAGS {
            if masked == flag.to_number() {
                return Ok(flag);
            }
        }
        Err(ApiError::invalid_argument(format!(
            "invalid flag number: {:#o}",
            flags
        )))
    }

    pub fn to_number(self) -> u32 {
        let bits = match self {
            R => libc::O_RDONLY,
            RPlus => libc::O_RDWR,
            RSync => libc::O_RDONLY | libc::O_SYNC,
            RSyncPlus => libc::O_RDWR | libc::O_SYNC,
            W => libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            WExcl => libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL,
            WPlus => libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
            WExclPlus => libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL,
            A => libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
            AExcl => libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND | libc::O_EXCL,
            APlus => libc::O_RDWR | libc::O_CREAT | libc::O_APPEND,
            AExclPlus => libc::O_RDWR | libc::O_CREAT | libc::O_APPEND | libc::O_EXCL,
        };
        bits as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            R => "r",
            RPlus => "r+",
            RSync => "rs",
            RSyncPlus => "rs+",
            W => "w",
            WExcl => "wx",
            WPlus => "w+",
            WExclPlus => "wx+",
            A => "a",
            AExcl => "ax",
            APlus => "a+",
            AExclPlus => "ax+",
        }
    }

    pub fn is_readable(self) -> bool {
        matches!(
            self,
            R | RPlus | RSync | RSyncPlus | WPlus | WExclPlus | APlus | AExclPlus
        )
    }

    pub fn is_writable(self) -> bool {
        !matches!(self, R | RSync)
    }

    pub fn is_appendable(self) -> bool {
        matches!(self, A | AExcl | APlus | AExclPlus)
    }

    pub fn is_truncating(self) -> bool {
        matches!(self, W | WExcl | WPlus | WExclPlus)
    }

    pub fn is_exclusive(self) -> bool {
        matches!(self, WExcl | WExclPlus | AExcl | AExclPlus)
    }

    pub fn is_synchronous(self) -> bool {
        matches!(self, RSync | RSyncPlus)
    }

    pub fn path_exists_action(self) -> ActionType {
        if self.is_exclusive() {
            ActionType::ThrowException
        } else if self.is_truncating() {
            ActionType::TruncateFile
        } else {
            ActionType::Nop
        }
    }

    pub fn path_not_exists_action(self) -> ActionType {
        if self.is_truncating() || self.is_appendable() {
            ActionType::CreateFile
        } else {
            ActionType::ThrowException
        }
    }

    /// Access bits requested by the flag for the permission check at
    /// open: 0o4 when readable, 0o2 when writable; execute is never set.
    pub fn access_mode(self) -> u32 {
        let mut mode = 0;
        if self.is_readable() {
            mode |= 0o4;
        }
        if self.is_writable() {
            mode |= 0o2;
        }
        mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        for s in [
            "r", "r+", "rs", "rs+", "w", "wx", "w+", "wx+", "a", "ax", "a+", "ax+",
        ] {
            assert_eq!(FileFlag::parse(s).unwrap().as_str(), s);
        }
        assert!(FileFlag::parse("rw").is_err());
        assert!(FileFlag::parse("").is_err());
    }

    #[test]
    fn test_numeric_round_trip() {
        for flag in ALL_FLAGS {
            assert_eq!(FileFlag::from_number(flag.to_number()).unwrap(), flag);
        }
    }

    #[test]
    fn test_traits() {
        assert!(FileFlag::R.is_readable());
        assert!(!FileFlag::R.is_writable());
        assert!(FileFlag::RSync.is_synchronous());
        assert!(FileFlag::WPlus.is_truncating());
        assert!(FileFlag::AExclPlus.is_appendable());
        assert!(FileFlag::AExclPlus.is_exclusive());
        assert!(FileFlag::A.is_writable());
        assert!(!FileFlag::A.is_readable());
    }

    #[test]
    fn test_action_table() {
        use ActionType::*;
        assert_eq!(FileFlag::WExcl.path_exists_action(), ThrowException);
        assert_eq!(FileFlag::WExcl.path_not_exists_action(), CreateFile);
        assert_eq!(FileFlag::W.path_exists_action(), TruncateFile);
        assert_eq!(FileFlag::W.path_not_exists_action(), CreateFile);
        assert_eq!(FileFlag::A.path_exists_action(), Nop);
        assert_eq!(FileFlag::A.path_not_exists_action(), CreateFile);
        assert_eq!(FileFlag::R.path_exists_action(), Nop);
        assert_eq!(FileFlag::R.path_not_exists_action(), ThrowException);
        assert_eq!(FileFlag::RPlus.path_not_exists_action(), ThrowException);
    }

    #[test]
    fn test_access_mode() {
        assert_eq!(FileFlag::R.access_mode(), 0o4);
        assert_eq!(FileFlag::W.access_mode(), 0o2);
        assert_eq!(FileFlag::RPlus.access_mode(), 0o6);
    }
}
