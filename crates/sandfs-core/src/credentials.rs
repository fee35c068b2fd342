// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Security identity attached to filesystem requests.

use serde::{Deserialize, Serialize};

/// The uid/gid triple pairs of a request: real, saved, and effective.
/// Access checks use the effective pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub suid: u32,
    pub sgid: u32,
    pub euid: u32,
    pub egid: u32,
}

impl Credentials {
    pub const ROOT: Credentials = Credentials {
        uid: 0,
        gid: 0,
        suid: 0,
        sgid: 0,
        euid: 0,
        egid: 0,
    };

    /// Credentials where the real, saved, and effective ids all match.
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            suid: uid,
            sgid: gid,
            euid: uid,
            egid: gid,
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::ROOT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_constant() {
        assert_eq!(Credentials::ROOT.uid, 0);
        assert_eq!(Credentials::ROOT.egid, 0);
    }

    #[test]
    fn test_new_copies_effective() {
        let cred = Credentials::new(1000, 1000);
        assert_eq!(cred.euid, 1000);
        assert_eq!(cred.sgid, 1000);
    }
}
