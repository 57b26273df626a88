//! VM records, on-disk layout and identity.
//!
//! A VM is a directory under `vms_dir` plus one [`VmRecord`] in the
//! registry. The record carries only static configuration; everything about
//! a VM's live state is recomputed by [`crate::status`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::arch::Architecture;
use crate::error::{QvmError, Result};

pub mod lifecycle;
pub mod process;
pub mod qmp;
pub mod remote;
pub mod seed;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Durable, static configuration of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub directory: PathBuf,
    pub hostname: String,
    pub username: String,
    pub architecture: Architecture,
    pub mac_address: String,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub disk_size: String,
    pub instance_id: String,
    /// OS label of the base image, e.g. `ubuntu-24.04`.
    pub os: String,
    /// Backing image of the overlay disk.
    pub base_image: PathBuf,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl VmRecord {
    pub fn layout(&self) -> VmLayout {
        VmLayout::new(&self.directory)
    }
}

// ---------------------------------------------------------------------------
// Directory layout
// ---------------------------------------------------------------------------

/// File names inside a VM directory.
#[derive(Debug, Clone)]
pub struct VmLayout {
    pub dir: PathBuf,
}

impl VmLayout {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    pub fn for_name(vms_dir: &Path, name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self::new(&vms_dir.join(name)))
    }

    pub fn disk(&self) -> PathBuf {
        self.dir.join("disk.qcow2")
    }

    pub fn seed_iso(&self) -> PathBuf {
        self.dir.join("seed.iso")
    }

    pub fn user_data(&self) -> PathBuf {
        self.dir.join("user-data")
    }

    pub fn meta_data(&self) -> PathBuf {
        self.dir.join("meta-data")
    }

    pub fn console_log(&self) -> PathBuf {
        self.dir.join("console.log")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("qemu.pid")
    }

    pub fn qmp_socket(&self) -> PathBuf {
        self.dir.join("qmp.sock")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.join(".reset-backup")
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,62}$").expect("static regex"));

/// Reject anything that could escape `vms_dir` or confuse the hosts file.
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name.contains("..") {
        Some("path traversal is not allowed")
    } else if !NAME_RE.is_match(name) {
        Some("use letters, digits, '.', '_' or '-' (max 63, starting alphanumeric)")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(QvmError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// QEMU's locally administered OUI followed by three bytes of SHA-256(name).
///
/// Stable across restarts; this is the key that correlates a registry entry
/// with neighbor-table entries.
pub fn derive_mac(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        digest[0], digest[1], digest[2]
    )
}

/// Fresh cloud-init instance-id; a new value forces re-provisioning.
pub fn new_instance_id(name: &str) -> String {
    format!("iid-{}-{}", name, Utc::now().format("%Y%m%d%H%M%S%3f"))
}

// ---------------------------------------------------------------------------
// Network attachment
// ---------------------------------------------------------------------------

/// How the emulator's NIC is attached to the host.
///
/// Only bridged and vmnet modes put the guest on a segment where the host's
/// neighbor table can see its MAC; `user` mode works but leaves only the
/// console and DNS signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    Bridge(String),
    VmnetShared,
    User,
}

impl NetworkMode {
    pub fn netdev_arg(&self) -> String {
        match self {
            NetworkMode::Bridge(br) => format!("bridge,id=net0,br={br}"),
            NetworkMode::VmnetShared => "vmnet-shared,id=net0".to_string(),
            NetworkMode::User => "user,id=net0".to_string(),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Bridge(br) => write!(f, "bridge:{br}"),
            NetworkMode::VmnetShared => f.write_str("vmnet-shared"),
            NetworkMode::User => f.write_str("user"),
        }
    }
}

impl FromStr for NetworkMode {
    type Err = QvmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "user" => Ok(NetworkMode::User),
            "vmnet-shared" | "vmnet" => Ok(NetworkMode::VmnetShared),
            other => match other.strip_prefix("bridge:") {
                Some(br) if !br.is_empty() => Ok(NetworkMode::Bridge(br.to_string())),
                _ => Err(QvmError::InvalidConfig {
                    key: "network".to_string(),
                    reason: format!("{other:?}: expected bridge:<name>, vmnet-shared or user"),
                }),
            },
        }
    }
}
