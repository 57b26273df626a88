//! Minimal QMP client over the emulator's control socket.
//!
//! Each call opens a fresh connection, reads the greeting, negotiates
//! capabilities and executes one command. Asynchronous events interleaved
//! with replies are skipped.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::error::{QvmError, Result};

/// Emulator run state as reported by `query-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Stopped by the hypervisor (`paused` or `suspended`).
    Paused,
    Other,
}

/// Out-of-band management query used by the status ladder.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// `None` when the socket is absent, unresponsive or speaks nonsense.
    async fn run_state(&self, socket: &Path) -> Option<RunState>;
}

/// Map a `query-status` return object to a [`RunState`].
pub fn parse_status(ret: &Value) -> RunState {
    match ret.get("status").and_then(Value::as_str) {
        Some("paused") | Some("suspended") => RunState::Paused,
        _ if ret.get("running").and_then(Value::as_bool) == Some(true) => RunState::Running,
        Some("running") => RunState::Running,
        _ => RunState::Other,
    }
}

#[derive(Debug, Clone)]
pub struct QmpClient {
    timeout: Duration,
}

impl Default for QmpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl QmpClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Execute one command and return its `return` payload.
    pub async fn execute(&self, socket: &Path, command: &str) -> Result<Value> {
        if !socket.exists() {
            return Err(QvmError::Qmp(format!("socket {} not present", socket.display())));
        }
        match tokio::time::timeout(self.timeout, exchange(socket, command)).await {
            Ok(result) => result,
            Err(_) => Err(QvmError::Qmp(format!(
                "`{command}` timed out after {:?} on {}",
                self.timeout,
                socket.display()
            ))),
        }
    }

    pub async fn query_status(&self, socket: &Path) -> Result<RunState> {
        self.execute(socket, "query-status")
            .await
            .map(|ret| parse_status(&ret))
    }

    pub async fn pause(&self, socket: &Path) -> Result<()> {
        self.execute(socket, "stop").await.map(drop)
    }

    pub async fn resume(&self, socket: &Path) -> Result<()> {
        self.execute(socket, "cont").await.map(drop)
    }

    /// ACPI power button; the guest decides whether to honour it.
    pub async fn powerdown(&self, socket: &Path) -> Result<()> {
        self.execute(socket, "system_powerdown").await.map(drop)
    }
}

#[async_trait]
impl ControlChannel for QmpClient {
    async fn run_state(&self, socket: &Path) -> Option<RunState> {
        match self.query_status(socket).await {
            Ok(state) => Some(state),
            Err(e) => {
                debug!(error = %e, "query-status unavailable");
                None
            }
        }
    }
}

async fn exchange(socket: &Path, command: &str) -> Result<Value> {
    let stream = UnixStream::connect(socket).await?;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let greeting = read_message(&mut lines).await?;
    if greeting.get("QMP").is_none() {
        return Err(QvmError::Qmp(format!("unexpected greeting: {greeting}")));
    }

    send(&mut write, "qmp_capabilities").await?;
    wait_for_return(&mut lines).await?;
    send(&mut write, command).await?;
    wait_for_return(&mut lines).await
}

async fn send(write: &mut OwnedWriteHalf, command: &str) -> Result<()> {
    let mut data = serde_json::to_string(&json!({ "execute": command }))?;
    data.push('\n');
    write.write_all(data.as_bytes()).await?;
    Ok(())
}

async fn read_message(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<Value> {
    match lines.next_line().await? {
        Some(line) => Ok(serde_json::from_str(&line)?),
        None => Err(QvmError::Qmp("connection closed unexpectedly".to_string())),
    }
}

async fn wait_for_return(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<Value> {
    loop {
        let message = read_message(lines).await?;
        if let Some(ret) = message.get("return") {
            return Ok(ret.clone());
        }
        if let Some(err) = message.get("error") {
            return Err(QvmError::Qmp(format!("error response: {err}")));
        }
        // Ignore asynchronous events.
    }
}
