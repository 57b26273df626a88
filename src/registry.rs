//! Registry: one JSON document holding every VM's static configuration.
//!
//! Writes are read-modify-write through a temp file in the same directory
//! followed by a rename, so readers never see a partial document. There is no
//! lock; concurrent writers race and the last rename wins.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{QvmError, Result};
use crate::vm::{VmLayout, VmRecord, derive_mac, new_instance_id, seed, validate_name};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    vms: BTreeMap<String, VmRecord>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub removed: Vec<String>,
    pub absorbed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Document> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Document::default()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Document::default());
        }
        serde_json::from_str(&text).map_err(|e| QvmError::Registry {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn save(&self, mut doc: Document) -> Result<()> {
        doc.version = FORMAT_VERSION;
        let dir = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &doc)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| QvmError::Registry {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        debug!(path = %self.path.display(), count = doc.vms.len(), "registry saved");
        Ok(())
    }

    /// Insert or replace.
    pub fn register(&self, record: &VmRecord) -> Result<()> {
        validate_name(&record.name)?;
        let mut doc = self.load()?;
        doc.vms.insert(record.name.clone(), record.clone());
        self.save(doc)
    }

    /// Returns whether an entry was removed.
    pub fn unregister(&self, name: &str) -> Result<bool> {
        let mut doc = self.load()?;
        let removed = doc.vms.remove(name).is_some();
        if removed {
            self.save(doc)?;
        }
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Result<Option<VmRecord>> {
        Ok(self.load()?.vms.remove(name))
    }

    pub fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.load()?.vms.into_keys().collect())
    }

    pub fn list(&self) -> Result<Vec<VmRecord>> {
        Ok(self.load()?.vms.into_values().collect())
    }

    /// Reconcile against `settings.vms_dir`: drop entries whose directory is
    /// gone and absorb VM directories nobody registered.
    pub fn sync(&self, settings: &Settings) -> Result<SyncReport> {
        let mut doc = self.load()?;
        let mut report = SyncReport::default();

        doc.vms.retain(|name, rec| {
            let keep = rec.directory.is_dir();
            if !keep {
                report.removed.push(name.clone());
            }
            keep
        });

        let entries = match std::fs::read_dir(&settings.vms_dir) {
            Ok(e) => e.collect::<std::io::Result<Vec<_>>>()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if doc.vms.contains_key(&name) || !entry.path().is_dir() {
                continue;
            }
            if validate_name(&name).is_err() {
                warn!(dir = %entry.path().display(), "skipping directory with invalid VM name");
                continue;
            }
            let layout = VmLayout::new(&entry.path());
            if !layout.disk().exists() && !layout.meta_data().exists() {
                continue;
            }
            let record = rederive(&name, &layout, settings);
            info!(vm = %name, "absorbed unregistered VM directory");
            report.absorbed.push(name.clone());
            doc.vms.insert(name, record);
        }

        if !report.removed.is_empty() || !report.absorbed.is_empty() {
            self.save(doc)?;
        }
        Ok(report)
    }
}

/// Rebuild a record from what is on disk, filling gaps from defaults.
fn rederive(name: &str, layout: &VmLayout, settings: &Settings) -> VmRecord {
    let (instance_id, hostname) = std::fs::read_to_string(layout.meta_data())
        .map(|t| seed::parse_meta_data(&t))
        .unwrap_or((None, None));
    let username = std::fs::read_to_string(layout.user_data())
        .ok()
        .and_then(|t| seed::parse_user_data_username(&t));
    let header = Qcow2Header::read(&layout.disk());
    let created: DateTime<Utc> = std::fs::metadata(&layout.dir)
        .and_then(|m| m.modified())
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());

    VmRecord {
        name: name.to_string(),
        directory: layout.dir.clone(),
        hostname: hostname.unwrap_or_else(|| name.to_string()),
        username: username.unwrap_or_else(|| settings.default_username.clone()),
        architecture: settings.default_arch,
        mac_address: derive_mac(name),
        memory_mb: settings.default_memory_mb,
        vcpus: settings.default_vcpus,
        disk_size: header
            .as_ref()
            .filter(|h| h.virtual_size > 0)
            .map(|h| format_disk_size(h.virtual_size))
            .unwrap_or_else(|| settings.default_disk_size.clone()),
        instance_id: instance_id.unwrap_or_else(|| new_instance_id(name)),
        os: settings.default_os.clone(),
        base_image: header.and_then(|h| h.backing_file).unwrap_or_default(),
        created,
        updated: Utc::now(),
    }
}

/// The parts of a qcow2 header a registry entry can be rebuilt from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qcow2Header {
    pub virtual_size: u64,
    pub backing_file: Option<PathBuf>,
}

impl Qcow2Header {
    pub fn read(disk: &Path) -> Option<Self> {
        use std::io::{Read, Seek, SeekFrom};

        let mut f = std::fs::File::open(disk).ok()?;
        let mut header = [0u8; 32];
        f.read_exact(&mut header).ok()?;
        if &header[0..4] != b"QFI\xfb" {
            return None;
        }
        let offset = u64::from_be_bytes(header[8..16].try_into().ok()?);
        let size = u32::from_be_bytes(header[16..20].try_into().ok()?) as usize;
        let virtual_size = u64::from_be_bytes(header[24..32].try_into().ok()?);

        let backing_file = if offset == 0 || size == 0 || size > 4096 {
            None
        } else {
            f.seek(SeekFrom::Start(offset)).ok()?;
            let mut name = vec![0u8; size];
            f.read_exact(&mut name).ok()?;
            String::from_utf8(name).ok().map(PathBuf::from)
        };
        Some(Self {
            virtual_size,
            backing_file,
        })
    }
}

/// `qemu-img` size string: the largest binary suffix that divides evenly.
pub fn format_disk_size(bytes: u64) -> String {
    for (suffix, shift) in [("T", 40), ("G", 30), ("M", 20), ("K", 10)] {
        let unit = 1u64 << shift;
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{suffix}", bytes / unit);
        }
    }
    bytes.to_string()
}
