// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for sandfs

use serde::{Deserialize, Serialize};

/// POSIX errno values carried by every filesystem error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    EPERM = 1,
    ENOENT = 2,
    EIO = 5,
    EBADF = 9,
    EACCES = 13,
    EBUSY = 16,
    EEXIST = 17,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    EFBIG = 27,
    ENOSPC = 28,
    EROFS = 30,
    ENOTEMPTY = 39,
    ENOTSUP = 95,
}

impl ErrorCode {
    pub fn errno(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::EPERM => "EPERM",
            ErrorCode::ENOENT => "ENOENT",
            ErrorCode::EIO => "EIO",
            ErrorCode::EBADF => "EBADF",
            ErrorCode::EACCES => "EACCES",
            ErrorCode::EBUSY => "EBUSY",
            ErrorCode::EEXIST => "EEXIST",
            ErrorCode::ENOTDIR => "ENOTDIR",
            ErrorCode::EISDIR => "EISDIR",
            ErrorCode::EINVAL => "EINVAL",
            ErrorCode::EFBIG => "EFBIG",
            ErrorCode::ENOSPC => "ENOSPC",
            ErrorCode::EROFS => "EROFS",
            ErrorCode::ENOTEMPTY => "ENOTEMPTY",
            ErrorCode::ENOTSUP => "ENOTSUP",
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::EPERM => "operation not permitted",
            ErrorCode::ENOENT => "no such file or directory",
            ErrorCode::EIO => "input/output error",
            ErrorCode::EBADF => "bad file descriptor",
            ErrorCode::EACCES => "permission denied",
            ErrorCode::EBUSY => "resource busy or locked",
            ErrorCode::EEXIST => "file exists",
            ErrorCode::ENOTDIR => "not a directory",
            ErrorCode::EISDIR => "is a directory",
            ErrorCode::EINVAL => "invalid argument",
            ErrorCode::EFBIG => "file too large",
            ErrorCode::ENOSPC => "no space left on device",
            ErrorCode::EROFS => "read-only file system",
            ErrorCode::ENOTEMPTY => "directory not empty",
            ErrorCode::ENOTSUP => "operation not supported",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core filesystem error: an errno-keyed code, a human message, and the
/// path it applies to when known.
#[derive(Clone, Debug, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("Error: {code}: {message}{}", fmt_path(.path))]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub path: Option<String>,
}

fn fmt_path(path: &Option<String>) -> String {
    match path {
        Some(p) => format!(", '{}'", p),
        None => String::new(),
    }
}

pub type FsResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
        }
    }

    pub fn with_path(code: ErrorCode, message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Error carrying the code's default message and a path.
    pub fn from_code(code: ErrorCode, path: impl Into<String>) -> Self {
        Self::with_path(code, code.default_message(), path)
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::ENOENT, path)
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::EEXIST, path)
    }

    pub fn access_denied(path: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::EACCES, path)
    }

    pub fn not_permitted(path: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::EPERM, path)
    }

    pub fn is_directory(path: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::EISDIR, path)
    }

    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::ENOTDIR, path)
    }

    pub fn not_empty(path: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::ENOTEMPTY, path)
    }

    pub fn busy(path: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::EBUSY, path)
    }

    pub fn read_only(path: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::EROFS, path)
    }

    pub fn bad_descriptor() -> Self {
        Self::new(ErrorCode::EBADF, ErrorCode::EBADF.default_message())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EINVAL, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EIO, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ENOTSUP, message)
    }

    pub fn errno(&self) -> u32 {
        self.code.errno()
    }

    /// Rewrite the error's path (and any occurrence of it inside the
    /// message) after the error crosses a backend boundary, so the caller
    /// sees the path it asked about rather than the backend-internal one.
    pub fn rescope_path(&mut self, inner: &str, outer: &str) {
        if let Some(p) = &self.path {
            if p == inner {
                self.path = Some(outer.to_string());
            }
        }
        if self.message.contains(inner) {
            self.message = self.message.replace(inner, outer);
        }
    }

    /// Wire form: `u32 length || utf-8 JSON`, length little-endian.
    pub fn serialize(&self) -> Vec<u8> {
        // A struct of a code, a string, and an optional string cannot fail
        // JSON encoding.
        let json = serde_json::to_vec(self).unwrap();
        let mut out = Vec::with_capacity(4 + json.len());
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&json);
        out
    }

    pub fn deserialize(data: &[u8]) -> FsResult<Self> {
        if data.len() < 4 {
            return Err(ApiError::io("truncated error record"));
        }
        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let body = data
            .get(4..4 + len)
            .ok_or_else(|| ApiError::io("truncated error record"))?;
        serde_json::from_slice(body).map_err(|e| ApiError::io(format!("bad error record: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        let err = ApiError::not_found("/a/b");
        assert_eq!(
            err.to_string(),
            "Error: ENOENT: no such file or directory, '/a/b'"
        );

        let err = ApiError::invalid_argument("bad flag");
        assert_eq!(err.to_string(), "Error: EINVAL: bad flag");
    }

    #[test]
    fn test_errno_values() {
        assert_eq!(ErrorCode::EPERM.errno(), 1);
        assert_eq!(ErrorCode::ENOENT.errno(), 2);
        assert_eq!(ErrorCode::ENOTEMPTY.errno(), 39);
        assert_eq!(ErrorCode::ENOTSUP.errno(), 95);
    }

    #[test]
    fn test_serialize_round_trip() {
        let err = ApiError::exists("/dir/file");
        let bytes = err.serialize();
        assert_eq!(
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize,
            bytes.len() - 4
        );
        let back = ApiError::deserialize(&bytes).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_deserialize_truncated() {
        assert!(ApiError::deserialize(&[1, 0]).is_err());
        assert!(ApiError::deserialize(&[255, 0, 0, 0, b'{']).is_err());
    }

    #[test]
    fn test_rescope_path() {
        let mut err = ApiError::not_found("/data/sub/x.txt");
        err.message = format!("{}, '/data/sub/x.txt'", err.message);
        err.rescope_path("/data/sub/x.txt", "/x.txt");
        assert_eq!(err.path.as_deref(), Some("/x.txt"));
        assert!(err.message.contains("'/x.txt'"));
    }
}
