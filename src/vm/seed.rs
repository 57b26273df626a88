//! NoCloud seed: `user-data`, `meta-data` and the `cidata` ISO.
//!
//! The instance-id in `meta-data` is the re-provisioning trigger: cloud-init
//! runs its first-boot modules again whenever it changes.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info};

use super::VmLayout;
use super::remote::shell_quote;
use crate::error::{QvmError, Result};

#[derive(Debug, Clone)]
pub struct SeedConfig {
    pub instance_id: String,
    pub hostname: String,
    pub username: String,
    pub public_key: String,
}

pub fn render_meta_data(cfg: &SeedConfig) -> String {
    format!(
        "instance-id: {}\nlocal-hostname: {}\n",
        cfg.instance_id, cfg.hostname
    )
}

pub fn render_user_data(cfg: &SeedConfig) -> String {
    format!(
        "#cloud-config\n\
         hostname: {host}\n\
         fqdn: {host}.local\n\
         manage_etc_hosts: true\n\
         ssh_pwauth: false\n\
         users:\n\
         \x20 - name: {user}\n\
         \x20   shell: /bin/bash\n\
         \x20   sudo: ALL=(ALL) NOPASSWD:ALL\n\
         \x20   lock_passwd: true\n\
         \x20   ssh_authorized_keys:\n\
         \x20     - {key}\n\
         packages:\n\
         \x20 - avahi-daemon\n\
         runcmd:\n\
         \x20 - [ sh, -c, {echo} ]\n",
        host = cfg.hostname,
        user = cfg.username,
        key = cfg.public_key.trim(),
        echo = shell_quote("ip -4 -o addr show scope global > /dev/console"),
    )
}

/// `(instance-id, local-hostname)` from a `meta-data` document.
pub fn parse_meta_data(text: &str) -> (Option<String>, Option<String>) {
    let mut iid = None;
    let mut host = None;
    for line in text.lines() {
        if let Some((k, v)) = line.split_once(':') {
            let v = v.trim().trim_matches('"').to_string();
            match k.trim() {
                "instance-id" if !v.is_empty() => iid = Some(v),
                "local-hostname" if !v.is_empty() => host = Some(v),
                _ => {}
            }
        }
    }
    (iid, host)
}

/// First `- name:` entry of the `users:` list in a `user-data` document.
pub fn parse_user_data_username(text: &str) -> Option<String> {
    let mut in_users = false;
    for line in text.lines() {
        if !line.starts_with(' ') && !line.starts_with('-') {
            in_users = line.trim_end() == "users:";
            continue;
        }
        if in_users {
            if let Some(rest) = line.trim_start().strip_prefix("- name:") {
                let name = rest.trim().trim_matches('"');
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        }
    }
    None
}

/// Write both documents and rebuild `seed.iso`.
pub async fn write_seed(layout: &VmLayout, cfg: &SeedConfig) -> Result<()> {
    tokio::fs::write(layout.user_data(), render_user_data(cfg)).await?;
    tokio::fs::write(layout.meta_data(), render_meta_data(cfg)).await?;
    build_iso(layout).await?;
    info!(instance_id = %cfg.instance_id, dir = %layout.dir.display(), "seed written");
    Ok(())
}

/// Replace only the instance-id, keeping the rest of the seed.
pub async fn rewrite_instance_id(layout: &VmLayout, instance_id: &str) -> Result<()> {
    let meta = tokio::fs::read_to_string(layout.meta_data()).await?;
    let (_, host) = parse_meta_data(&meta);
    let host = host.unwrap_or_default();
    tokio::fs::write(
        layout.meta_data(),
        format!("instance-id: {instance_id}\nlocal-hostname: {host}\n"),
    )
    .await?;
    build_iso(layout).await
}

async fn build_iso(layout: &VmLayout) -> Result<()> {
    let iso = layout.seed_iso();
    if iso.exists() {
        tokio::fs::remove_file(&iso).await?;
    }
    let user_data = layout.user_data();
    let meta_data = layout.meta_data();

    let attempts: [(&str, Vec<String>); 3] = [
        (
            "cloud-localds",
            vec![path_str(&iso), path_str(&user_data), path_str(&meta_data)],
        ),
        (
            "genisoimage",
            vec![
                "-output".into(),
                path_str(&iso),
                "-volid".into(),
                "cidata".into(),
                "-joliet".into(),
                "-rock".into(),
                path_str(&user_data),
                path_str(&meta_data),
            ],
        ),
        (
            "mkisofs",
            vec![
                "-output".into(),
                path_str(&iso),
                "-volid".into(),
                "cidata".into(),
                "-joliet".into(),
                "-rock".into(),
                path_str(&user_data),
                path_str(&meta_data),
            ],
        ),
    ];

    let mut last_error = String::from("no ISO tool found");
    for (program, args) in &attempts {
        match Command::new(program).args(args).output().await {
            Ok(out) if out.status.success() => {
                debug!(program, iso = %iso.display(), "seed iso built");
                return Ok(());
            }
            Ok(out) => {
                last_error = format!("{program}: {}", String::from_utf8_lossy(&out.stderr).trim())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => last_error = format!("{program}: {e}"),
        }
    }

    // hdiutil wants a directory holding exactly the two documents.
    let staging = tempfile::tempdir_in(&layout.dir)?;
    tokio::fs::copy(&user_data, staging.path().join("user-data")).await?;
    tokio::fs::copy(&meta_data, staging.path().join("meta-data")).await?;
    match Command::new("hdiutil")
        .args(["makehybrid", "-iso", "-joliet", "-default-volume-name", "cidata", "-o"])
        .arg(&iso)
        .arg(staging.path())
        .output()
        .await
    {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => Err(QvmError::command(
            "hdiutil",
            String::from_utf8_lossy(&out.stderr).trim().to_string(),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(QvmError::command(
            "cloud-localds",
            format!("{last_error}; install cloud-image-utils or genisoimage"),
        )),
        Err(e) => Err(QvmError::command("hdiutil", e.to_string())),
    }
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SeedConfig {
        SeedConfig {
            instance_id: "iid-alpha-1".into(),
            hostname: "alpha".into(),
            username: "dev".into(),
            public_key: "ssh-ed25519 AAAA op@host\n".into(),
        }
    }

    #[test]
    fn meta_data_round_trips() {
        let (iid, host) = parse_meta_data(&render_meta_data(&cfg()));
        assert_eq!(iid.as_deref(), Some("iid-alpha-1"));
        assert_eq!(host.as_deref(), Some("alpha"));
    }

    #[test]
    fn user_data_carries_user_and_key() {
        let text = render_user_data(&cfg());
        assert!(text.starts_with("#cloud-config\n"));
        assert!(text.contains("      - ssh-ed25519 AAAA op@host\n"));
        assert_eq!(parse_user_data_username(&text).as_deref(), Some("dev"));
    }

    #[test]
    fn username_only_from_users_block() {
        let text = "#cloud-config\ngroups:\n  - name: wheel\nusers:\n  - default\n  - name: \"ops\"\n";
        assert_eq!(parse_user_data_username(text).as_deref(), Some("ops"));
        assert_eq!(parse_user_data_username("#cloud-config\n"), None);
    }
}
