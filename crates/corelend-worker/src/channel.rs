//! Control channels: how a core allocation reaches the worker.
//!
//! - [`SocketChannel`]: live commands on the worker's control port.
//! - [`FileChannel`]: rewrite the config file and restart when needed.
//!
//! The supervisor picks one at startup from the host's port policy. A
//! socket channel that cannot be reached falls back to a file channel for
//! the failing call only.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use corelend_core::{ControlMode, WorkerConfig};

use crate::artifact;
use crate::error::{ChannelError, WorkerResult};
use crate::process::WorkerProcess;
use crate::protocol::{ControlCommand, read_until_prompt};

/// A way of delivering commands and core counts to a running worker.
#[async_trait]
pub trait ControlChannel: Send {
    fn mode(&self) -> ControlMode;

    fn is_connected(&self) -> bool;

    /// Establish the session. A no-op for channels without one.
    async fn connect(&mut self) -> Result<(), ChannelError>;

    /// Move the worker from `previous` to `cores`. Zero means pause.
    async fn apply_cores(
        &mut self,
        process: &mut WorkerProcess,
        previous: u32,
        cores: u32,
    ) -> WorkerResult<()>;

    /// Send one command and return the worker's response.
    async fn send(&mut self, command: ControlCommand) -> Result<String, ChannelError>;

    async fn disconnect(&mut self);
}

// ── Socket ─────────────────────────────────────────────────────────

/// Live session on the worker's control port.
pub struct SocketChannel {
    addr: String,
    prompt: String,
    password: Option<String>,
    connect_timeout: Duration,
    read_timeout: Duration,
    settle_delay: Duration,
    stream: Option<TcpStream>,
}

impl SocketChannel {
    pub fn new(config: &WorkerConfig, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", config.control_host, port),
            prompt: config.prompt.clone(),
            password: config.control_password.clone(),
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            settle_delay: config.settle_delay(),
            stream: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn exchange(
        stream: &mut TcpStream,
        line: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, ChannelError> {
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        read_until_prompt(stream, prompt, timeout).await
    }
}

#[async_trait]
impl ControlChannel for SocketChannel {
    fn mode(&self) -> ControlMode {
        ControlMode::Channel
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> Result<(), ChannelError> {
        self.stream = None;

        let mut stream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(ChannelError::Connect {
                        addr: self.addr.clone(),
                        source,
                    });
                }
                Err(_) => return Err(ChannelError::ConnectTimeout(self.addr.clone())),
            };
        let _ = stream.set_nodelay(true);

        let banner = read_until_prompt(&mut stream, &self.prompt, self.read_timeout).await?;
        debug!(addr = %self.addr, banner = %banner, "control channel handshake");
        self.stream = Some(stream);

        if let Some(password) = self.password.clone()
            && let Err(e) = self.send(ControlCommand::Auth(password)).await
        {
            self.stream = None;
            return Err(e);
        }

        info!(addr = %self.addr, "control channel connected");
        Ok(())
    }

    async fn apply_cores(
        &mut self,
        _process: &mut WorkerProcess,
        _previous: u32,
        cores: u32,
    ) -> WorkerResult<()> {
        if cores == 0 {
            self.send(ControlCommand::Pause).await?;
            return Ok(());
        }

        // The worker ignores slot changes while paused.
        self.send(ControlCommand::Unpause).await?;
        tokio::time::sleep(self.settle_delay).await;
        self.send(ControlCommand::ModifySlotCpus(cores)).await?;
        tokio::time::sleep(self.settle_delay).await;
        self.send(ControlCommand::Unpause).await?;
        Ok(())
    }

    async fn send(&mut self, command: ControlCommand) -> Result<String, ChannelError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ChannelError::NotConnected);
        };

        let response =
            match Self::exchange(stream, &command.to_line(), &self.prompt, self.read_timeout).await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(addr = %self.addr, command = %command, error = %e, "control channel lost");
                    self.stream = None;
                    return Err(e);
                }
            };

        debug!(command = %command, response = %response, "control command sent");
        if response.starts_with("ERROR") {
            return Err(ChannelError::Rejected {
                command: command.to_string(),
                response,
            });
        }
        Ok(response)
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(addr = %self.addr, "control channel closed");
        }
    }
}

// ── File ───────────────────────────────────────────────────────────

/// Config-file control: rewrite `<cpus/>` and restart on large changes.
pub struct FileChannel {
    path: PathBuf,
    restart_threshold: u32,
    kill_timeout: Duration,
}

impl FileChannel {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            path: config.config_path(),
            restart_threshold: config.restart_threshold,
            kill_timeout: config.kill_timeout(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ControlChannel for FileChannel {
    fn mode(&self) -> ControlMode {
        ControlMode::File
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn connect(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn apply_cores(
        &mut self,
        process: &mut WorkerProcess,
        previous: u32,
        cores: u32,
    ) -> WorkerResult<()> {
        if cores == 0 {
            info!("pausing worker by stopping it");
            process.terminate(self.kill_timeout).await;
            return Ok(());
        }

        artifact::rewrite_cores(&self.path, cores)?;

        let running = process.is_running();
        let delta = cores.abs_diff(previous);
        if !running || delta > self.restart_threshold {
            info!(previous, cores, running, "restarting worker to apply core count");
            if running {
                process.terminate(self.kill_timeout).await;
            }
            process.spawn()?;
        } else {
            debug!(previous, cores, "core change left for the worker to pick up");
        }
        Ok(())
    }

    async fn send(&mut self, command: ControlCommand) -> Result<String, ChannelError> {
        Err(ChannelError::Unsupported(match command {
            ControlCommand::Auth(_) => "auth",
            ControlCommand::Pause => "pause",
            ControlCommand::Unpause => "unpause",
            ControlCommand::ModifySlotCpus(_) => "modify-slot-cpus",
            ControlCommand::RequestWork => "request-work",
            ControlCommand::Shutdown => "shutdown",
        }))
    }

    async fn disconnect(&mut self) {}
}
