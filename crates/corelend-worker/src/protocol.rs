//! Control channel wire protocol.
//!
//! Plain text over TCP. Every command is one line; every response is
//! whatever the worker prints until it shows its prompt again:
//!
//! ```text
//! ← Welcome to the worker control interface
//! ← >
//! → unpause
//! ← >
//! → modify-slot-cpus 4
//! ← >
//! ```
//!
//! [`read_until_prompt`] is the only framing rule. The connection banner
//! and every command response go through it.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ChannelError;

/// Commands understood by the worker's control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Auth(String),
    Pause,
    Unpause,
    ModifySlotCpus(u32),
    RequestWork,
    Shutdown,
}

impl ControlCommand {
    /// The line sent on the wire, without the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            ControlCommand::Auth(password) => format!("auth {password}"),
            ControlCommand::Pause => "pause".to_string(),
            ControlCommand::Unpause => "unpause".to_string(),
            ControlCommand::ModifySlotCpus(cores) => format!("modify-slot-cpus {cores}"),
            ControlCommand::RequestWork => "request-work".to_string(),
            ControlCommand::Shutdown => "shutdown".to_string(),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Auth(_) => f.write_str("auth ****"),
            other => f.write_str(&other.to_line()),
        }
    }
}

/// Read from `reader` until a prompt line arrives and return everything
/// before it, trimmed.
///
/// A prompt line is one that, without its line ending, either equals the
/// trimmed prompt or starts with the full prompt. The prompt usually comes
/// without a trailing newline, so partial lines are checked too.
pub async fn read_until_prompt<R>(
    reader: &mut R,
    prompt: &str,
    timeout: Duration,
) -> Result<String, ChannelError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, read_frame(reader, prompt)).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::ReadTimeout),
    }
}

async fn read_frame<R>(reader: &mut R, prompt: &str) -> Result<String, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(ChannelError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(response) = split_at_prompt(&buf, prompt) {
            return Ok(response);
        }
    }
}

fn split_at_prompt(buf: &[u8], prompt: &str) -> Option<String> {
    let marker = prompt.trim();
    let text = String::from_utf8_lossy(buf);
    let mut consumed = 0;

    for line in text.split_inclusive('\n') {
        let content = line.trim_end_matches(['\r', '\n']);
        if content.trim() == marker || (!prompt.is_empty() && content.starts_with(prompt)) {
            return Some(text[..consumed].trim().to_string());
        }
        consumed += line.len();
    }
    None
}
