//! Persistent command session.
//!
//! Multiplexes stdin/stdout/stderr over one long-lived shell (or subsystem)
//! channel. Both output streams land in a single combined buffer; command
//! completion is detected by running a prompt matcher over the last segment
//! of that buffer, so context persists between commands at the cost of
//! prompt-synchronized output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::bytes::Regex;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::supervisor::Supervisor;

pub type PromptMatcher = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;
pub type ErrorMatcher = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;
pub type PromptSanitizer = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

static SANITIZERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"\x1b\[\?1h\x1b=", r"\x08.", r"\x1b\[m"]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("static sanitize pattern"))
        .collect()
});

static ERROR_OUTPUT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(error|bad|invalid|unknown)").expect("static error pattern"));

/// Default prompt detection: the last line contains `"$ "`.
pub fn default_prompt_matcher(line: &[u8]) -> bool {
    contains(line, b"$ ")
}

/// Default error detection: any of `error|bad|invalid|unknown`, case
/// insensitive, anywhere in the collected output.
pub fn default_error_matcher(content: &[u8]) -> bool {
    ERROR_OUTPUT_RE.is_match(content)
}

/// Combined stdout+stderr stream with completion signalling.
struct OutputBuffer {
    buf: Mutex<Vec<u8>>,
    notify: Notify,
    closed: AtomicBool,
}

impl OutputBuffer {
    fn new() -> Self {
        Self {
            buf: Mutex::new(Vec::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn append(&self, data: &[u8]) {
        self.buf.lock().extend_from_slice(data);
        self.notify.notify_one();
    }

    fn reset(&self) {
        self.buf.lock().clear();
    }

    fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Configuration for a [`CommandSession`].
pub struct CommandSessionBuilder {
    prompt_matcher: PromptMatcher,
    error_matcher: ErrorMatcher,
    sanitize_prompt_line: PromptSanitizer,
    separator: Vec<u8>,
    subsystem: Option<String>,
}

impl Default for CommandSessionBuilder {
    fn default() -> Self {
        Self {
            prompt_matcher: Box::new(default_prompt_matcher),
            error_matcher: Box::new(default_error_matcher),
            // The prompt segment is discarded by default.
            sanitize_prompt_line: Box::new(|_| Vec::new()),
            separator: b"\n".to_vec(),
            subsystem: None,
        }
    }
}

impl CommandSessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Predicate deciding whether the last output segment is the prompt.
    pub fn prompt_matcher(
        mut self,
        matcher: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.prompt_matcher = Box::new(matcher);
        self
    }

    /// Predicate deciding whether collected output is an error.
    pub fn error_matcher(
        mut self,
        matcher: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.error_matcher = Box::new(matcher);
        self
    }

    /// Rewrites the matched prompt segment; a non-empty result is appended
    /// to the command output.
    pub fn sanitize_prompt_line(
        mut self,
        sanitizer: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        self.sanitize_prompt_line = Box::new(sanitizer);
        self
    }

    /// Output segment separator, `"\n"` by default.
    pub fn separator(mut self, separator: impl Into<Vec<u8>>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Requests the named subsystem instead of a shell.
    pub fn subsystem(mut self, name: impl Into<String>) -> Self {
        self.subsystem = Some(name.into());
        self
    }

    /// Opens the session channel, starts the shell (or subsystem) and waits
    /// for the initial prompt.
    pub async fn connect(self, supervisor: &Supervisor) -> Result<CommandSession> {
        let channel = supervisor.controller().open_session().await?;

        if let Some(name) = &self.subsystem {
            channel
                .request_subsystem(true, name)
                .await
                .map_err(|e| Error::Channel(format!("subsystem request failed: {e}")))?;
        } else {
            channel
                .request_shell(true)
                .await
                .map_err(|e| Error::Channel(format!("shell request failed: {e}")))?;
        }

        let output = Arc::new(OutputBuffer::new());
        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let task = tokio::spawn(channel_task(channel, stdin_rx, output.clone()));

        let session = CommandSession {
            stdin_tx,
            output,
            task,
            prompt_matcher: self.prompt_matcher,
            error_matcher: self.error_matcher,
            sanitize_prompt_line: self.sanitize_prompt_line,
            separator: self.separator,
        };

        // The session is ready once the first prompt has been seen.
        session.wait_until().await?;
        Ok(session)
    }
}

/// A long-lived shell/subsystem session with prompt-split output.
pub struct CommandSession {
    stdin_tx: mpsc::Sender<Vec<u8>>,
    output: Arc<OutputBuffer>,
    task: JoinHandle<()>,
    prompt_matcher: PromptMatcher,
    error_matcher: ErrorMatcher,
    sanitize_prompt_line: PromptSanitizer,
    separator: Vec<u8>,
}

impl CommandSession {
    pub fn builder() -> CommandSessionBuilder {
        CommandSessionBuilder::new()
    }

    /// Connects with default matchers.
    pub async fn connect(supervisor: &Supervisor) -> Result<Self> {
        CommandSessionBuilder::new().connect(supervisor).await
    }

    /// Replaces the prompt matcher for subsequent commands.
    pub fn set_prompt_matcher(
        &mut self,
        matcher: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) {
        self.prompt_matcher = Box::new(matcher);
    }

    /// Runs `cmd` and returns its output, collected up to the next prompt.
    ///
    /// Output matching the error matcher comes back as
    /// [`Error::Terminal`] carrying that output.
    pub async fn run(&self, cmd: &str) -> Result<Vec<u8>> {
        self.output.reset();
        self.stdin_tx
            .send(format!("{cmd}\n").into_bytes())
            .await
            .map_err(|_| Error::Disconnected)?;

        let result = self.wait_until().await?;
        if (self.error_matcher)(&result) {
            return Err(Error::Terminal { output: result });
        }
        Ok(result)
    }

    /// Waits until the prompt matcher accepts the last segment of the
    /// combined buffer, then returns everything before it, sanitized.
    async fn wait_until(&self) -> Result<Vec<u8>> {
        loop {
            {
                let buf = self.output.snapshot();
                let segments = split_segments(&buf, &self.separator);
                let last = *segments.last().expect("split yields at least one segment");
                if (self.prompt_matcher)(last) {
                    let mut kept: Vec<Vec<u8>> = segments[..segments.len() - 1]
                        .iter()
                        .map(|segment| segment.to_vec())
                        .collect();
                    let sanitized_prompt = (self.sanitize_prompt_line)(last);
                    if !sanitized_prompt.is_empty() {
                        kept.push(sanitized_prompt);
                    }
                    return Ok(sanitize_output(join_segments(&kept, &self.separator)));
                }
            }
            if self.output.is_closed() {
                return Err(Error::Disconnected);
            }
            self.output.notify.notified().await;
        }
    }

    /// Closes the channel and waits for the session task to finish.
    pub async fn close(self) {
        drop(self.stdin_tx);
        let _ = self.task.await;
    }
}

/// Owns the session channel: writes queued stdin, appends every output
/// message (stdout and stderr alike) to the combined buffer.
async fn channel_task(
    mut channel: Channel<Msg>,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    output: Arc<OutputBuffer>,
) {
    loop {
        tokio::select! {
            input = stdin_rx.recv() => match input {
                Some(data) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        debug!("session stdin write failed: {e}");
                        break;
                    }
                }
                None => {
                    let _ = channel.eof().await;
                    break;
                }
            },

            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => output.append(&data),
                Some(ChannelMsg::ExtendedData { data, .. }) => output.append(&data),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    let _ = channel.close().await;
    output.close();
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty()
        || haystack
            .windows(needle.len())
            .any(|window| window == needle)
}

fn split_segments<'a>(data: &'a [u8], separator: &[u8]) -> Vec<&'a [u8]> {
    if separator.is_empty() {
        return vec![data];
    }
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + separator.len() <= data.len() {
        if &data[i..i + separator.len()] == separator {
            segments.push(&data[start..i]);
            i += separator.len();
            start = i;
        } else {
            i += 1;
        }
    }
    segments.push(&data[start..]);
    segments
}

fn join_segments(segments: &[Vec<u8>], separator: &[u8]) -> Vec<u8> {
    let mut joined = Vec::new();
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            joined.extend_from_slice(separator);
        }
        joined.extend_from_slice(segment);
    }
    joined
}

/// Strips terminal control sequences and one trailing CR.
fn sanitize_output(data: Vec<u8>) -> Vec<u8> {
    let mut data = data;
    for sanitizer in SANITIZERS.iter() {
        data = sanitizer.replace_all(&data, &b""[..]).into_owned();
    }
    if data.last() == Some(&b'\r') {
        data.pop();
    }
    data
}
