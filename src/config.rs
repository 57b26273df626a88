//! Layered configuration.
//!
//! Every setting is looked up through an ordered list of named sources,
//! highest precedence first:
//!
//! ```text
//! explicit (CLI flags)  >  environment (QVM_*)  >  file (config.toml)  >  default
//! ```
//!
//! [`Layered::lookup`] walks the list and returns the first hit together with
//! the name of the source that supplied it; [`Settings`] is the typed result
//! threaded through the rest of the crate.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::arch::Architecture;
use crate::error::{QvmError, Result};
use crate::net::dns::DnsStrategy;
use crate::paths::QvmPaths;
use crate::vm::NetworkMode;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    VmsDir,
    RegistryPath,
    SshKey,
    DefaultArch,
    DefaultMemoryMb,
    DefaultVcpus,
    DefaultDiskSize,
    DefaultUsername,
    DefaultOs,
    KeepPaths,
    HostsFile,
    DnsOrder,
    Network,
    ProbeTimeoutMs,
    SshTimeoutMs,
    ConsoleTailLines,
    RunningWaitAttempts,
    RunningWaitIntervalSecs,
}

impl Key {
    pub const ALL: [Key; 18] = [
        Key::VmsDir,
        Key::RegistryPath,
        Key::SshKey,
        Key::DefaultArch,
        Key::DefaultMemoryMb,
        Key::DefaultVcpus,
        Key::DefaultDiskSize,
        Key::DefaultUsername,
        Key::DefaultOs,
        Key::KeepPaths,
        Key::HostsFile,
        Key::DnsOrder,
        Key::Network,
        Key::ProbeTimeoutMs,
        Key::SshTimeoutMs,
        Key::ConsoleTailLines,
        Key::RunningWaitAttempts,
        Key::RunningWaitIntervalSecs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Key::VmsDir => "vms_dir",
            Key::RegistryPath => "registry_path",
            Key::SshKey => "ssh_key",
            Key::DefaultArch => "default_arch",
            Key::DefaultMemoryMb => "default_memory_mb",
            Key::DefaultVcpus => "default_vcpus",
            Key::DefaultDiskSize => "default_disk_size",
            Key::DefaultUsername => "default_username",
            Key::DefaultOs => "default_os",
            Key::KeepPaths => "keep_paths",
            Key::HostsFile => "hosts_file",
            Key::DnsOrder => "dns_order",
            Key::Network => "network",
            Key::ProbeTimeoutMs => "probe_timeout_ms",
            Key::SshTimeoutMs => "ssh_timeout_ms",
            Key::ConsoleTailLines => "console_tail_lines",
            Key::RunningWaitAttempts => "running_wait_attempts",
            Key::RunningWaitIntervalSecs => "running_wait_interval_secs",
        }
    }

    pub fn env_var(self) -> String {
        format!("QVM_{}", self.name().to_ascii_uppercase())
    }

    pub fn from_name(name: &str) -> Option<Key> {
        Key::ALL.into_iter().find(|k| k.name() == name)
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

pub trait ConfigSource {
    fn name(&self) -> &'static str;
    fn get(&self, key: Key) -> Option<String>;
}

/// Values supplied directly by the caller (CLI flags).
#[derive(Debug, Default, Clone)]
pub struct ExplicitSource {
    values: BTreeMap<Key, String>,
}

impl ExplicitSource {
    pub fn set(&mut self, key: Key, value: impl Into<String>) -> &mut Self {
        self.values.insert(key, value.into());
        self
    }
}

impl ConfigSource for ExplicitSource {
    fn name(&self) -> &'static str {
        "explicit"
    }

    fn get(&self, key: Key) -> Option<String> {
        self.values.get(&key).cloned()
    }
}

/// `QVM_<KEY>` environment variables, captured once at construction.
#[derive(Debug, Clone)]
pub struct EnvSource {
    vars: HashMap<String, String>,
}

impl EnvSource {
    pub fn from_process() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            vars: vars
                .into_iter()
                .filter(|(k, _)| k.starts_with("QVM_"))
                .collect(),
        }
    }
}

impl ConfigSource for EnvSource {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn get(&self, key: Key) -> Option<String> {
        self.vars
            .get(&key.env_var())
            .filter(|v| !v.is_empty())
            .cloned()
    }
}

/// Flat `key = value` table from `config.toml`.
#[derive(Debug, Default, Clone)]
pub struct FileSource {
    values: BTreeMap<Key, String>,
}

impl FileSource {
    /// Load `path`; a missing file yields an empty source.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map_err(|reason| QvmError::InvalidConfig {
                key: path.display().to_string(),
                reason,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let table: toml::Table = toml::from_str(text).map_err(|e| e.to_string())?;
        let mut values = BTreeMap::new();
        for (name, value) in table {
            let Some(key) = Key::from_name(&name) else {
                warn!(key = %name, "ignoring unknown config key");
                continue;
            };
            values.insert(key, toml_to_string(&value)?);
        }
        Ok(Self { values })
    }
}

fn toml_to_string(value: &toml::Value) -> std::result::Result<String, String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Array(items) => items
            .iter()
            .map(toml_to_string)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(|parts| parts.join(",")),
        other => Err(format!("unsupported value {other}")),
    }
}

impl ConfigSource for FileSource {
    fn name(&self) -> &'static str {
        "file"
    }

    fn get(&self, key: Key) -> Option<String> {
        self.values.get(&key).cloned()
    }
}

/// Built-in defaults, relative to the resolved host paths.
#[derive(Debug, Clone)]
pub struct DefaultSource {
    paths: QvmPaths,
    home: PathBuf,
}

impl DefaultSource {
    pub fn new(paths: QvmPaths, home: PathBuf) -> Self {
        Self { paths, home }
    }

    fn default_ssh_key(&self) -> PathBuf {
        let ssh_dir = self.home.join(".ssh");
        ["id_ed25519", "id_ecdsa", "id_rsa"]
            .iter()
            .map(|name| ssh_dir.join(name))
            .find(|p| p.with_extension("pub").exists())
            .unwrap_or_else(|| ssh_dir.join("id_ed25519"))
    }
}

#[cfg(target_os = "macos")]
const DEFAULT_NETWORK: &str = "vmnet-shared";
#[cfg(not(target_os = "macos"))]
const DEFAULT_NETWORK: &str = "bridge:virbr0";

impl ConfigSource for DefaultSource {
    fn name(&self) -> &'static str {
        "default"
    }

    fn get(&self, key: Key) -> Option<String> {
        let value = match key {
            Key::VmsDir => self.paths.vms.display().to_string(),
            Key::RegistryPath => self.paths.registry.display().to_string(),
            Key::SshKey => self.default_ssh_key().display().to_string(),
            Key::DefaultArch => Architecture::host().to_string(),
            Key::DefaultMemoryMb => "2048".into(),
            Key::DefaultVcpus => "2".into(),
            Key::DefaultDiskSize => "20G".into(),
            Key::DefaultUsername => "ubuntu".into(),
            Key::DefaultOs => "ubuntu-24.04".into(),
            Key::KeepPaths => ".ssh,.gitconfig,.config/gh".into(),
            Key::HostsFile => "/etc/hosts".into(),
            Key::DnsOrder => "fast,system".into(),
            Key::Network => DEFAULT_NETWORK.into(),
            Key::ProbeTimeoutMs => "1000".into(),
            Key::SshTimeoutMs => "1000".into(),
            Key::ConsoleTailLines => "400".into(),
            Key::RunningWaitAttempts => "30".into(),
            Key::RunningWaitIntervalSecs => "10".into(),
        };
        Some(value)
    }
}

// ---------------------------------------------------------------------------
// Layered lookup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub value: String,
    pub source: &'static str,
}

pub struct Layered {
    sources: Vec<Box<dyn ConfigSource>>,
}

impl Layered {
    /// Sources must be given highest precedence first.
    pub fn new(sources: Vec<Box<dyn ConfigSource>>) -> Self {
        Self { sources }
    }

    pub fn standard(explicit: ExplicitSource, paths: &QvmPaths, home: PathBuf) -> Result<Self> {
        let file = FileSource::load(&paths.config_file())?;
        Ok(Self::new(vec![
            Box::new(explicit),
            Box::new(EnvSource::from_process()),
            Box::new(file),
            Box::new(DefaultSource::new(paths.clone(), home)),
        ]))
    }

    /// [`standard`](Self::standard) rooted at `$HOME`.
    pub fn for_process(explicit: ExplicitSource) -> Result<(Self, QvmPaths)> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| QvmError::InvalidConfig {
                key: "HOME".to_string(),
                reason: "not set".to_string(),
            })?;
        let paths = QvmPaths::under_home(&home);
        Ok((Self::standard(explicit, &paths, home)?, paths))
    }

    pub fn lookup(&self, key: Key) -> Option<Resolved> {
        self.sources.iter().find_map(|source| {
            source.get(key).map(|value| Resolved {
                value,
                source: source.name(),
            })
        })
    }

    fn require(&self, key: Key) -> Result<String> {
        self.lookup(key)
            .map(|r| r.value)
            .ok_or_else(|| QvmError::InvalidConfig {
                key: key.name().to_string(),
                reason: "no value in any source".to_string(),
            })
    }

    fn parse<T: std::str::FromStr>(&self, key: Key) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        let raw = self.require(key)?;
        raw.trim().parse::<T>().map_err(|e| QvmError::InvalidConfig {
            key: key.name().to_string(),
            reason: format!("{raw:?}: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Typed settings
// ---------------------------------------------------------------------------

/// A bounded retry loop: `attempts` polls separated by `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl WaitPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    pub fn total(&self) -> Duration {
        self.interval * self.attempts
    }

    /// Human-readable total bound, e.g. "5 minutes" or "90 seconds".
    pub fn describe(&self) -> String {
        let secs = self.total().as_secs();
        if secs >= 60 && secs % 60 == 0 {
            let mins = secs / 60;
            format!("{mins} minute{}", if mins == 1 { "" } else { "s" })
        } else {
            format!("{secs} seconds")
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub vms_dir: PathBuf,
    pub registry_path: PathBuf,
    /// Private key used for guest access; the public half is `<key>.pub`.
    pub ssh_key: PathBuf,
    pub default_arch: Architecture,
    pub default_memory_mb: u32,
    pub default_vcpus: u32,
    pub default_disk_size: String,
    pub default_username: String,
    pub default_os: String,
    pub keep_paths: Vec<String>,
    pub hosts_file: PathBuf,
    pub dns_order: Vec<DnsStrategy>,
    pub network: NetworkMode,
    pub probe_timeout: Duration,
    pub ssh_timeout: Duration,
    pub console_tail_lines: usize,
    pub running_wait: WaitPolicy,
}

impl Settings {
    pub fn from_layers(layers: &Layered) -> Result<Self> {
        let dns_order = split_list(&layers.require(Key::DnsOrder)?)
            .iter()
            .map(|s| s.parse::<DnsStrategy>())
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            vms_dir: PathBuf::from(layers.require(Key::VmsDir)?),
            registry_path: PathBuf::from(layers.require(Key::RegistryPath)?),
            ssh_key: PathBuf::from(layers.require(Key::SshKey)?),
            default_arch: layers.require(Key::DefaultArch)?.parse()?,
            default_memory_mb: layers.parse(Key::DefaultMemoryMb)?,
            default_vcpus: layers.parse(Key::DefaultVcpus)?,
            default_disk_size: layers.require(Key::DefaultDiskSize)?,
            default_username: layers.require(Key::DefaultUsername)?,
            default_os: layers.require(Key::DefaultOs)?,
            keep_paths: split_list(&layers.require(Key::KeepPaths)?),
            hosts_file: PathBuf::from(layers.require(Key::HostsFile)?),
            dns_order,
            network: layers.require(Key::Network)?.parse()?,
            probe_timeout: Duration::from_millis(layers.parse(Key::ProbeTimeoutMs)?),
            ssh_timeout: Duration::from_millis(layers.parse(Key::SshTimeoutMs)?),
            console_tail_lines: layers.parse(Key::ConsoleTailLines)?,
            running_wait: WaitPolicy::new(
                layers.parse(Key::RunningWaitAttempts)?,
                Duration::from_secs(layers.parse(Key::RunningWaitIntervalSecs)?),
            ),
        })
    }

    /// Standard resolution against the process environment and the user's
    /// config file.
    pub fn ssh_public_key_path(&self) -> PathBuf {
        let mut name = self.ssh_key.as_os_str().to_os_string();
        name.push(".pub");
        PathBuf::from(name)
    }

    /// Read the operator's public key; a missing key is a configuration error.
    pub fn ssh_public_key(&self) -> Result<String> {
        let path = self.ssh_public_key_path();
        std::fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(QvmError::MissingSshKey { path })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
