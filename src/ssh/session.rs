//! Remote command execution over an authenticated SSH connection

use std::time::Duration;

use async_trait::async_trait;
use russh::client::Handle;
use russh::{ChannelMsg, Disconnect};
use tracing::{debug, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Collected result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the server closed the channel without reporting a status
    pub exit_status: Option<u32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Something that runs shell commands on a target host
#[async_trait]
pub trait RemoteShell: Send {
    /// Host identifier used in errors and logs
    fn host(&self) -> &str;

    async fn exec(&mut self, command: &str) -> Result<ExecOutput, SshError>;
}

/// An authenticated SSH connection
pub struct RemoteSession {
    handle: Handle<ClientHandler>,
    host_id: String,
    timeout: Duration,
}

impl RemoteSession {
    pub fn new(handle: Handle<ClientHandler>, host_id: String, timeout: Duration) -> Self {
        Self {
            handle,
            host_id,
            timeout,
        }
    }

    /// Close the connection politely
    pub async fn close(self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("Disconnect from {} failed: {}", self.host_id, e);
        }
    }

    async fn run(&mut self, command: &str) -> Result<ExecOutput, SshError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::RemoteCommand {
                host: self.host_id.clone(),
                message: format!("failed to open exec channel: {}", e),
            })?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::RemoteCommand {
                host: self.host_id.clone(),
                message: format!("failed to execute command: {}", e),
            })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status: Option<u32> = None;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                // ext=1 is stderr
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status: status }) => exit_status = Some(status),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        Ok(ExecOutput {
            exit_status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

#[async_trait]
impl RemoteShell for RemoteSession {
    fn host(&self) -> &str {
        &self.host_id
    }

    async fn exec(&mut self, command: &str) -> Result<ExecOutput, SshError> {
        debug!("Remote exec on {}: {}", self.host_id, command);

        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.run(command)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Remote command on {} timed out after {:?}",
                    self.host_id, timeout
                );
                Err(SshError::Timeout {
                    host: self.host_id.clone(),
                    stage: "remote command",
                    secs: timeout.as_secs(),
                })
            }
        }
    }
}
