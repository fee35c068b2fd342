// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The backend registry: named constructors with validated options, and
//! the mount map that assembles a [`Vfs`].

use std::sync::Arc;

use tracing::debug;

use sandfs_core::backends::async_key_value::AsyncKeyValueFileSystem;
use sandfs_core::error::{ApiError, FsResult};
use sandfs_core::{
    in_memory_filesystem, AsyncMirrorFs, FileSystem, FolderAdapterFs, LockedFs, OverlayFs, Vfs,
};

use crate::schema::{BackendOptions, BackendSchema, OptionKind, OptionSpec, OptionValue};

/// A backend selection in a mount map: a prebuilt instance, a named
/// backend with options, or a bare name (shorthand for a configuration
/// with no options).
pub enum MountEntry {
    Fs(Arc<dyn FileSystem>),
    Config(BackendConfig),
    Name(String),
}

pub struct BackendConfig {
    pub backend: String,
    pub options: BackendOptions,
}

const IN_MEMORY_SCHEMA: BackendSchema = BackendSchema {
    name: "InMemory",
    options: &[(
        "name",
        OptionSpec {
            kinds: &[OptionKind::String],
            optional: true,
            description: "display name of the store",
            validator: None,
        },
    )],
};

const OVERLAY_SCHEMA: BackendSchema = BackendSchema {
    name: "OverlayFS",
    options: &[
        (
            "writable",
            OptionSpec {
                kinds: &[OptionKind::FileSystem],
                optional: false,
                description: "the upper, writable layer",
                validator: None,
            },
        ),
        (
            "readable",
            OptionSpec {
                kinds: &[OptionKind::FileSystem],
                optional: false,
                description: "the lower, read-only layer",
                validator: None,
            },
        ),
    ],
};

const ASYNC_MIRROR_SCHEMA: BackendSchema = BackendSchema {
    name: "AsyncMirror",
    options: &[
        (
            "sync",
            OptionSpec {
                kinds: &[OptionKind::FileSystem],
                optional: false,
                description: "the synchronous shadow filesystem",
                validator: Some(|v| match v {
                    OptionValue::FileSystem(fs) if fs.metadata().synchronous => Ok(()),
                    _ => Err(ApiError::invalid_argument(
                        "the 'sync' option must be a synchronous filesystem",
                    )),
                }),
            },
        ),
        (
            "async",
            OptionSpec {
                kinds: &[OptionKind::FileSystem],
                optional: false,
                description: "the asynchronous filesystem to mirror",
                validator: None,
            },
        ),
    ],
};

const FOLDER_ADAPTER_SCHEMA: BackendSchema = BackendSchema {
    name: "FolderAdapter",
    options: &[
        (
            "folder",
            OptionSpec {
                kinds: &[OptionKind::String],
                optional: false,
                description: "the subtree to scope to",
                validator: None,
            },
        ),
        (
            "wrapped",
            OptionSpec {
                kinds: &[OptionKind::FileSystem],
                optional: false,
                description: "the filesystem to scope",
                validator: None,
            },
        ),
    ],
};

pub fn schema_for(backend: &str) -> FsResult<&'static BackendSchema> {
    match backend {
        "InMemory" => Ok(&IN_MEMORY_SCHEMA),
        "OverlayFS" => Ok(&OVERLAY_SCHEMA),
        "AsyncMirror" => Ok(&ASYNC_MIRROR_SCHEMA),
        "FolderAdapter" => Ok(&FOLDER_ADAPTER_SCHEMA),
        _ => Err(ApiError::invalid_argument(format!(
            "unknown backend '{}'",
            backend
        ))),
    }
}

/// Validate options and construct a ready-to-mount backend.
pub async fn create_backend(
    backend: &str,
    options: BackendOptions,
) -> FsResult<Arc<dyn FileSystem>> {
    let schema = schema_for(backend)?;
    schema.validate(&options)?;
    debug!(backend, "creating backend");

    match backend {
        "InMemory" => {
            let name = options
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("InMemory")
                .to_string();
            Ok(Arc::new(in_memory_filesystem(name)?))
        }
        "OverlayFS" => {
            let writable = options.get("writable").and_then(|v| v.as_filesystem());
            let readable = options.get("readable").and_then(|v| v.as_filesystem());
            // Validation guarantees both are present filesystems.
            let overlay = OverlayFs::new(writable.unwrap(), readable.unwrap())?;
            overlay.initialize().await?;
            // Overlay operations are multi-step; serialize them per path.
            Ok(Arc::new(LockedFs::new(Arc::new(overlay))))
        }
        "AsyncMirror" => {
            let sync_fs = options.get("sync").and_then(|v| v.as_filesystem());
            let async_fs = options.get("async").and_then(|v| v.as_filesystem());
            let mirror = AsyncMirrorFs::new(sync_fs.unwrap(), async_fs.unwrap())?;
            mirror.initialize().await?;
            Ok(Arc::new(mirror))
        }
        "FolderAdapter" => {
            let folder = options.get("folder").and_then(|v| v.as_str());
            let wrapped = options.get("wrapped").and_then(|v| v.as_filesystem());
            let adapter = FolderAdapterFs::new(folder.unwrap(), wrapped.unwrap())?;
            adapter.initialize().await?;
            Ok(Arc::new(adapter))
        }
        _ => unreachable!("schema_for rejected unknown backends"),
    }
}

/// Wrap an asynchronous key-value engine for safe concurrent use.
pub fn locked(fs: AsyncKeyValueFileSystem) -> Arc<dyn FileSystem> {
    Arc::new(LockedFs::new(Arc::new(fs)))
}

/// Build a [`Vfs`] from a mount map. A bare backend name is shorthand
/// for a configuration with no options.
pub async fn mount_map(map: Vec<(String, MountEntry)>) -> FsResult<Vfs> {
    let mut mounts: Vec<(String, Arc<dyn FileSystem>)> = Vec::with_capacity(map.len());
    for (point, entry) in map {
        let fs = match entry {
            MountEntry::Fs(fs) => fs,
            MountEntry::Config(config) => create_backend(&config.backend, config.options).await?,
            MountEntry::Name(name) => create_backend(&name, BackendOptions::new()).await?,
        };
        mounts.push((point, fs));
    }
    let vfs = Vfs::new()?;
    vfs.initialize(mounts)?;
    Ok(vfs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandfs_core::flag::FileFlag;

    #[tokio::test]
    async fn test_bare_name_shorthand() {
        let vfs = mount_map(vec![("/".to_string(), MountEntry::Name("InMemory".into()))])
            .await
            .unwrap();
        vfs.write_file("/f", b"x", FileFlag::W, 0o644).await.unwrap();
        assert!(vfs.exists("/f").await);
    }

    fn expect_err<T>(result: FsResult<T>) -> ApiError {
        match result {
            Ok(_) => panic!("expected an error, got Ok"),
            Err(e) => e,
        }
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let err = expect_err(create_backend("NoSuchBackend", BackendOptions::new()).await);
        assert!(err.message.contains("unknown backend"));
    }

    #[tokio::test]
    async fn test_overlay_from_config() {
        let lower: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("lower").unwrap());
        let upper: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("upper").unwrap());
        lower
            .write_file("/base.txt", b"base", FileFlag::W, 0o644, &Default::default())
            .await
            .unwrap();

        let mut options = BackendOptions::new();
        options.insert("writable".into(), OptionValue::FileSystem(upper));
        options.insert("readable".into(), OptionValue::FileSystem(lower));
        let overlay = create_backend("OverlayFS", options).await.unwrap();

        let data = overlay
            .read_file("/base.txt", FileFlag::R, &Default::default())
            .await
            .unwrap();
        assert_eq!(data, b"base");
    }

    #[tokio::test]
    async fn test_missing_option_reported() {
        let mut options = BackendOptions::new();
        options.insert(
            "writable".into(),
            OptionValue::FileSystem(Arc::new(in_memory_filesystem("upper").unwrap())),
        );
        let err = expect_err(create_backend("OverlayFS", options).await);
        assert!(err.message.contains("missing required option 'readable'"));
    }

    #[tokio::test]
    async fn test_mistyped_option_suggestion() {
        let mut options = BackendOptions::new();
        options.insert(
            "writable".into(),
            OptionValue::FileSystem(Arc::new(in_memory_filesystem("upper").unwrap())),
        );
        options.insert(
            "readble".into(),
            OptionValue::FileSystem(Arc::new(in_memory_filesystem("lower").unwrap())),
        );
        let err = expect_err(create_backend("OverlayFS", options).await);
        assert!(err.message.contains("did you mean 'readable'"));
    }

    #[tokio::test]
    async fn test_locked_async_engine_in_mount_map() {
        let store = Arc::new(sandfs_core::testing::InMemoryAsyncStore::new("kv"));
        let engine = AsyncKeyValueFileSystem::new(store).await.unwrap();
        let vfs = mount_map(vec![
            ("/".to_string(), MountEntry::Name("InMemory".into())),
            ("/kv".to_string(), MountEntry::Fs(locked(engine))),
        ])
        .await
        .unwrap();
        vfs.write_file("/kv/f", b"x", FileFlag::W, 0o644).await.unwrap();
        assert!(vfs.exists("/kv/f").await);
    }

    #[tokio::test]
    async fn test_async_mirror_requires_sync_shadow() {
        let store = Arc::new(sandfs_core::testing::InMemoryAsyncStore::new("a"));
        let async_fs: Arc<dyn FileSystem> =
            Arc::new(AsyncKeyValueFileSystem::new(store).await.unwrap());
        let mut options = BackendOptions::new();
        options.insert("sync".into(), OptionValue::FileSystem(async_fs.clone()));
        options.insert("async".into(), OptionValue::FileSystem(async_fs));
        let err = expect_err(create_backend("AsyncMirror", options).await);
        assert!(err.message.contains("synchronous"));
    }
}
