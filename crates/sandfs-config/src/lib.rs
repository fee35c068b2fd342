// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Backend registry and mount-map configuration.
//!
//! Each backend declares an option schema; options are validated before
//! construction, and unknown keys are reported with the closest known
//! key as a suggestion. A mount map builds a ready [`Vfs`] from backend
//! names, configurations, or prebuilt filesystem instances.

pub mod registry;
pub mod schema;

pub use registry::{create_backend, mount_map, BackendConfig, MountEntry};
pub use schema::{BackendSchema, OptionKind, OptionSpec, OptionValue};
