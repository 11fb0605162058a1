//! One-shot command execution.
//!
//! Every call opens a fresh session channel, so no state persists between
//! commands. For stateful interaction use
//! [`CommandSession`](super::CommandSession).

use russh::{ChannelMsg, Pty};
use tracing::debug;

use crate::error::{Error, Result};
use crate::supervisor::Supervisor;

/// Runs commands over per-command SSH sessions.
pub struct Commander<'a> {
    supervisor: &'a Supervisor,
    request_pty: bool,
}

impl<'a> Commander<'a> {
    pub fn new(supervisor: &'a Supervisor) -> Self {
        Self {
            supervisor,
            request_pty: false,
        }
    }

    /// Requests a dumb PTY (`vt100`, echo off, 115200 baud) for each
    /// command. Some programs only drop color and interactive chrome when a
    /// terminal of this shape is present.
    pub fn request_pty(mut self, enable: bool) -> Self {
        self.request_pty = enable;
        self
    }

    /// Runs `cmd`, returning its stdout and stderr. A non-zero exit status
    /// is an error.
    pub async fn run(&self, cmd: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let outcome = self.exec(cmd).await?;
        if outcome.status != 0 {
            return Err(Error::ExitStatus(outcome.status));
        }
        Ok((outcome.stdout, outcome.stderr))
    }

    /// Runs `cmd`, returning stdout and stderr interleaved in arrival
    /// order. A non-zero exit status is an error.
    pub async fn combined_output(&self, cmd: &str) -> Result<Vec<u8>> {
        let outcome = self.exec(cmd).await?;
        if outcome.status != 0 {
            return Err(Error::ExitStatus(outcome.status));
        }
        Ok(outcome.combined)
    }

    async fn exec(&self, cmd: &str) -> Result<ExecOutcome> {
        let mut channel = self.supervisor.controller().open_session().await?;

        if self.request_pty {
            channel
                .request_pty(
                    true,
                    "vt100",
                    80,
                    24,
                    0,
                    0,
                    &[
                        (Pty::ECHO, 0),
                        (Pty::TTY_OP_ISPEED, 115200),
                        (Pty::TTY_OP_OSPEED, 115200),
                    ],
                )
                .await
                .map_err(|e| Error::Channel(format!("pty request failed: {e}")))?;
        }

        debug!(command = cmd, "running one-shot command");
        channel
            .exec(true, cmd)
            .await
            .map_err(|e| Error::Channel(format!("exec failed: {e}")))?;

        let mut outcome = ExecOutcome::default();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    outcome.stdout.extend_from_slice(&data);
                    outcome.combined.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        outcome.stderr.extend_from_slice(&data);
                        outcome.combined.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    outcome.status = exit_status;
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
        Ok(outcome)
    }
}

#[derive(Default)]
struct ExecOutcome {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
    status: u32,
}
