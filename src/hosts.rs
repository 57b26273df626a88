//! HostsSync: keep VM name → best-IP mappings in a hosts file.
//!
//! A VM's previous mapping is removed wherever it appears. If a line maps
//! other names as well, only the VM's name is taken off it. Lines that never
//! mention the VM are written back byte for byte.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::Result;

pub const MARKER: &str = "# qvm";

/// Rewrite `text` so each `(name, ip)` pair maps exactly as given; `None`
/// drops the name.
pub fn apply(text: &str, updates: &BTreeMap<String, Option<Ipv4Addr>>) -> String {
    let mut out = String::with_capacity(text.len() + 64);
    for line in text.lines() {
        match strip_names(line, updates) {
            LineEdit::Keep => {
                out.push_str(line);
                out.push('\n');
            }
            LineEdit::Replace(l) => {
                out.push_str(&l);
                out.push('\n');
            }
            LineEdit::Drop => {}
        }
    }
    for (name, ip) in updates {
        if let Some(ip) = ip {
            out.push_str(&format!("{ip}\t{name} {MARKER}\n"));
        }
    }
    out
}

enum LineEdit {
    Keep,
    Replace(String),
    Drop,
}

fn strip_names(line: &str, updates: &BTreeMap<String, Option<Ipv4Addr>>) -> LineEdit {
    let (body, comment) = match line.find('#') {
        Some(i) => (&line[..i], Some(&line[i..])),
        None => (line, None),
    };
    let mut fields = body.split_whitespace();
    let Some(addr) = fields.next() else {
        return LineEdit::Keep;
    };
    let names: Vec<&str> = fields.collect();
    if !names.iter().any(|n| updates.contains_key(*n)) {
        return LineEdit::Keep;
    }
    let remaining: Vec<&str> = names.into_iter().filter(|n| !updates.contains_key(*n)).collect();
    if remaining.is_empty() {
        return LineEdit::Drop;
    }
    let mut rebuilt = format!("{addr}\t{}", remaining.join(" "));
    if let Some(c) = comment.filter(|c| c.trim() != MARKER) {
        rebuilt.push(' ');
        rebuilt.push_str(c);
    }
    LineEdit::Replace(rebuilt)
}

#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Apply `updates`; returns whether the file changed.
    pub fn update(&self, updates: &BTreeMap<String, Option<Ipv4Addr>>) -> Result<bool> {
        let current = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let next = apply(&current, updates);
        if next == current {
            debug!(path = %self.path.display(), "hosts file already up to date");
            return Ok(false);
        }

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(next.as_bytes())?;
        if let Ok(meta) = std::fs::metadata(&self.path) {
            std::fs::set_permissions(tmp.path(), meta.permissions())?;
        }
        tmp.persist(&self.path).map_err(|e| e.error)?;
        info!(path = %self.path.display(), entries = updates.len(), "hosts file updated");
        Ok(true)
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        self.update(&BTreeMap::from([(name.to_string(), None)]))
    }
}
