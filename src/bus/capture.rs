//! Frame sources - local capture process or piped capture lines
//!
//! A capture process (by default `candump can0`) prints one frame per line.
//! Lines that do not parse are skipped; the source only ends when the
//! underlying stream closes.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

use super::frame::Frame;
use crate::config::CaptureConfig;
use crate::state::now_ms;

/// Anything that yields bus frames in arrival order
#[async_trait]
pub trait FrameSource: Send {
    /// Human readable source name for logs
    fn name(&self) -> &str;

    /// Next frame, or `None` once the source is exhausted
    async fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Line-oriented frame reader shared by all line sources
///
/// Lines are split on raw bytes so a line that is not valid UTF-8 is
/// skipped like any other garbage instead of ending the stream.
pub struct LineFrameReader<R> {
    lines: SplitStream<BufReader<R>>,
    skipped: u64,
}

impl<R: AsyncRead + Unpin + Send> LineFrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: SplitStream::new(BufReader::new(reader).split(b'\n')),
            skipped: 0,
        }
    }

    /// Number of lines dropped as unparseable so far
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        while let Some(line) = self.lines.next().await {
            let bytes = line.context("Failed to read capture line")?;
            let Ok(line) = std::str::from_utf8(&bytes) else {
                self.skipped += 1;
                trace!(bytes = %hex::encode(&bytes), "Skipping non-UTF-8 capture line");
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            match Frame::parse_capture_line(line, now_ms()) {
                Some(frame) => return Ok(Some(frame)),
                None => {
                    self.skipped += 1;
                    trace!(line = %line, "Skipping unparseable capture line");
                }
            }
        }
        Ok(None)
    }
}

/// Capture process spawned from configuration
pub struct CaptureProcess {
    name: String,
    child: Child,
    reader: LineFrameReader<tokio::process::ChildStdout>,
}

impl CaptureProcess {
    /// Spawn the capture command with its stdout piped
    pub fn spawn(config: &CaptureConfig) -> Result<Self> {
        let name = std::iter::once(config.program.as_str())
            .chain(config.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn capture process: {}", name))?;

        let stdout = child
            .stdout
            .take()
            .context("Capture process has no stdout")?;

        info!(command = %name, "Bus capture started");

        Ok(Self {
            name,
            child,
            reader: LineFrameReader::new(stdout),
        })
    }

    /// Stop the capture process
    pub async fn stop(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Capture process already exited: {}", e);
        }
    }
}

#[async_trait]
impl FrameSource for CaptureProcess {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self.reader.next_frame().await?;
        if frame.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => warn!(command = %self.name, %status, "Capture process exited"),
                _ => warn!(command = %self.name, "Capture stream closed"),
            }
        }
        Ok(frame)
    }
}

/// Capture lines piped on stdin (e.g. `candump can0 | coachlink --stdin`)
pub struct StdinSource {
    reader: LineFrameReader<tokio::io::Stdin>,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            reader: LineFrameReader::new(tokio::io::stdin()),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSource for StdinSource {
    fn name(&self) -> &str {
        "stdin"
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.reader.next_frame().await
    }
}
