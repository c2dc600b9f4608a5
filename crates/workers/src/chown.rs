//! Ownership restoration for retrieved files.
//!
//! A worker running as the requesting user can chown directly; a shared
//! deployment delegates to a privileged helper executable. Both shapes hide
//! behind one capability so transfer-get does not care which is configured.

use async_trait::async_trait;
use nearline_core::config::TransferGetConfig;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait Chowner: Send + Sync + 'static {
    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()>;
}

/// Ownership restoration disabled.
pub struct NoChown;

#[async_trait]
impl Chowner for NoChown {
    async fn chown(&self, _path: &Path, _uid: u32, _gid: u32) -> std::io::Result<()> {
        Ok(())
    }
}

/// Direct chown; requires the process to own the file or hold CAP_CHOWN.
pub struct DirectChown;

#[async_trait]
impl Chowner for DirectChown {
    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::os::unix::fs::chown(&path, Some(uid), Some(gid))
        })
        .await
        .map_err(std::io::Error::other)?
    }
}

/// Delegation to a setuid helper: `<command> <uid> <gid> <path>`.
pub struct HelperChown {
    command: String,
}

impl HelperChown {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Chowner for HelperChown {
    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
        let status = tokio::process::Command::new(&self.command)
            .arg(uid.to_string())
            .arg(gid.to_string())
            .arg(path)
            .status()
            .await?;
        if !status.success() {
            return Err(std::io::Error::other(format!(
                "chown helper {} exited with {status}",
                self.command
            )));
        }
        Ok(())
    }
}

/// Build the configured chown capability.
pub fn from_config(config: &TransferGetConfig) -> Arc<dyn Chowner> {
    if !config.chown {
        return Arc::new(NoChown);
    }
    match &config.chown_command {
        Some(command) => Arc::new(HelperChown::new(command)),
        None => Arc::new(DirectChown),
    }
}
