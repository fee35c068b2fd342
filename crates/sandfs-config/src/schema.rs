// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Option schemas and their validation.

use std::collections::HashMap;
use std::sync::Arc;

use sandfs_core::error::{ApiError, FsResult};
use sandfs_core::FileSystem;

/// A value supplied for a backend option.
#[derive(Clone)]
pub enum OptionValue {
    String(String),
    Number(f64),
    Boolean(bool),
    FileSystem(Arc<dyn FileSystem>),
}

impl OptionValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::String(_) => OptionKind::String,
            OptionValue::Number(_) => OptionKind::Number,
            OptionValue::Boolean(_) => OptionKind::Boolean,
            OptionValue::FileSystem(_) => OptionKind::FileSystem,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_filesystem(&self) -> Option<Arc<dyn FileSystem>> {
        match self {
            OptionValue::FileSystem(fs) => Some(fs.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionValue::String(s) => write!(f, "String({:?})", s),
            OptionValue::Number(n) => write!(f, "Number({})", n),
            OptionValue::Boolean(b) => write!(f, "Boolean({})", b),
            OptionValue::FileSystem(fs) => write!(f, "FileSystem({})", fs.metadata().name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionKind {
    String,
    Number,
    Boolean,
    FileSystem,
}

impl OptionKind {
    fn as_str(self) -> &'static str {
        match self {
            OptionKind::String => "string",
            OptionKind::Number => "number",
            OptionKind::Boolean => "boolean",
            OptionKind::FileSystem => "filesystem",
        }
    }
}

/// Declared shape of one backend option.
pub struct OptionSpec {
    pub kinds: &'static [OptionKind],
    pub optional: bool,
    pub description: &'static str,
    pub validator: Option<fn(&OptionValue) -> FsResult<()>>,
}

/// A backend's full option schema.
pub struct BackendSchema {
    pub name: &'static str,
    pub options: &'static [(&'static str, OptionSpec)],
}

pub type BackendOptions = HashMap<String, OptionValue>;

impl BackendSchema {
    pub fn validate(&self, options: &BackendOptions) -> FsResult<()> {
        for (key, spec) in self.options {
            match options.get(*key) {
                None => {
                    if !spec.optional {
                        return Err(ApiError::invalid_argument(format!(
                            "[{}] missing required option '{}': {}",
                            self.name, key, spec.description
                        )));
                    }
                }
                Some(value) => {
                    if !spec.kinds.contains(&value.kind()) {
                        let expected: Vec<&str> =
                            spec.kinds.iter().map(|k| k.as_str()).collect();
                        return Err(ApiError::invalid_argument(format!(
                            "[{}] option '{}' has type {}, expected {}",
                            self.name,
                            key,
                            value.kind().as_str(),
                            expected.join(" or ")
                        )));
                    }
                    if let Some(validator) = spec.validator {
                        validator(value)?;
                    }
                }
            }
        }

        for key in options.keys() {
            if !self.options.iter().any(|(k, _)| k == key) {
                let message = match self.suggest(key) {
                    Some(suggestion) => format!(
                        "[{}] unknown option '{}'; did you mean '{}'?",
                        self.name, key, suggestion
                    ),
                    None => format!("[{}] unknown option '{}'", self.name, key),
                };
                return Err(ApiError::invalid_argument(message));
            }
        }
        Ok(())
    }

    fn suggest(&self, key: &str) -> Option<&'static str> {
        self.options
            .iter()
            .map(|(k, _)| (*k, levenshtein(key, k)))
            .min_by_key(|(_, d)| *d)
            .map(|(k, _)| k)
    }
}

/// Classic dynamic-programming edit distance, used only to improve
/// unknown-option messages.
pub(crate) fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
