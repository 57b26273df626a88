//! Guest architectures and the emulator table.
//!
//! Every architecture-dependent choice (emulator binary, machine type,
//! accelerator chain, default CPU model, firmware) is read from the single
//! [`ARCH_TABLE`]; nothing else in the crate matches on architecture strings.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QvmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
    #[serde(rename = "i386")]
    I386,
}

/// Emulator settings for one architecture.
#[derive(Debug)]
pub struct ArchSpec {
    pub arch: Architecture,
    pub binary: &'static str,
    pub machine: &'static str,
    /// Accelerator chain in QEMU's `accel=a:b` fallback syntax.
    pub accel: &'static str,
    pub cpu: &'static str,
    /// UEFI firmware images to try, in order. Empty when the machine boots
    /// from its built-in BIOS.
    pub firmware: &'static [&'static str],
}

#[cfg(target_os = "macos")]
const HOST_ACCEL: &str = "hvf:tcg";
#[cfg(not(target_os = "macos"))]
const HOST_ACCEL: &str = "kvm:tcg";

const AARCH64_FIRMWARE: &[&str] = &[
    "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
    "/usr/share/AAVMF/AAVMF_CODE.fd",
    "/usr/share/edk2/aarch64/QEMU_EFI.fd",
    "/opt/homebrew/share/qemu/edk2-aarch64-code.fd",
    "/usr/local/share/qemu/edk2-aarch64-code.fd",
];

pub static ARCH_TABLE: [ArchSpec; 3] = [
    ArchSpec {
        arch: Architecture::X86_64,
        binary: "qemu-system-x86_64",
        machine: "q35",
        accel: HOST_ACCEL,
        cpu: "max",
        firmware: &[],
    },
    ArchSpec {
        arch: Architecture::Arm64,
        binary: "qemu-system-aarch64",
        machine: "virt",
        accel: HOST_ACCEL,
        cpu: "max",
        firmware: AARCH64_FIRMWARE,
    },
    ArchSpec {
        arch: Architecture::I386,
        binary: "qemu-system-i386",
        machine: "pc",
        accel: HOST_ACCEL,
        cpu: "qemu32",
        firmware: &[],
    },
];

impl Architecture {
    pub fn spec(self) -> &'static ArchSpec {
        let idx = match self {
            Architecture::X86_64 => 0,
            Architecture::Arm64 => 1,
            Architecture::I386 => 2,
        };
        &ARCH_TABLE[idx]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
            Architecture::I386 => "i386",
        }
    }

    /// The architecture this binary was compiled for, falling back to x86_64.
    pub fn host() -> Self {
        match std::env::consts::ARCH {
            "aarch64" => Architecture::Arm64,
            "x86" => Architecture::I386,
            _ => Architecture::X86_64,
        }
    }
}

impl ArchSpec {
    /// First firmware image present on this host.
    pub fn find_firmware(&self) -> Option<PathBuf> {
        self.firmware
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = QvmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Ok(Architecture::X86_64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            "i386" | "i686" | "x86" => Ok(Architecture::I386),
            other => Err(QvmError::UnknownArchitecture {
                arch: other.to_string(),
            }),
        }
    }
}
