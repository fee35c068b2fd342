// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! sandfs core: a virtual filesystem kernel with POSIX-style semantics
//! over pluggable storage backends.
//!
//! The engine turns key-value stores (synchronous or asynchronous) into
//! full filesystems, unions a writable layer over a read-only one,
//! projects asynchronous backends behind a synchronous mirror, scopes
//! backends to subtrees, and routes paths to backends through a mount
//! table with a process-wide file-descriptor table.

pub mod backends;
pub mod credentials;
pub mod error;
pub mod file;
pub mod filesystem;
pub mod flag;
pub mod inode;
pub mod mutex;
pub mod path;
pub mod stats;
pub mod testing;
pub mod vfs;

pub use credentials::Credentials;
pub use error::{ApiError, ErrorCode, FsResult};
pub use file::{File, PreloadFile};
pub use filesystem::{FileSystem, FileSystemMetadata};
pub use flag::{ActionType, FileFlag};
pub use inode::Inode;
pub use stats::{FileType, Stats};
pub use vfs::{Vfs, DEFAULT_ACCESS_MODE, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};

pub use backends::async_key_value::{
    AsyncKeyValueFileSystem, AsyncKeyValueStore, AsyncKvTransaction,
};
pub use backends::folder::FolderAdapterFs;
pub use backends::key_value::{
    SimpleSyncRwTransaction, SimpleSyncStore, SyncKeyValueFileSystem, SyncKeyValueStore,
    SyncKvTransaction, TxKind,
};
pub use backends::locked::LockedFs;
pub use backends::memory::{in_memory_filesystem, InMemoryStore};
pub use backends::mirror::AsyncMirrorFs;
pub use backends::overlay::OverlayFs;
