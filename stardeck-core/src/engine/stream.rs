//! Line streams over long-running engine processes.

use crate::error::{Result, StardeckError};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lines of stderr kept for the error detail of a failed process.
const STDERR_TAIL_LINES: usize = 20;

/// Ordered output lines from an engine operation, plus its final outcome.
///
/// Lines arrive through a bounded queue fed by a producer task. Dropping the stream
/// aborts the producer, which kills the underlying process.
pub struct LineStream {
    rx: mpsc::Receiver<String>,
    producer: Option<JoinHandle<Result<()>>>,
}

impl LineStream {
    pub fn new(rx: mpsc::Receiver<String>, producer: JoinHandle<Result<()>>) -> Self {
        Self { rx, producer: Some(producer) }
    }

    /// A stream over lines that are already known, ending with `outcome`.
    pub fn from_lines(lines: Vec<String>, outcome: Result<()>) -> Self {
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        let producer = tokio::spawn(async move {
            for line in lines {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            outcome
        });
        Self::new(rx, producer)
    }

    /// Next line, or `None` once the producer has finished.
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drain any remaining lines and return the operation's outcome.
    pub async fn finish(mut self) -> Result<()> {
        while self.rx.recv().await.is_some() {}
        match self.producer.take() {
            Some(handle) => handle
                .await
                .map_err(|e| StardeckError::Internal(format!("stream producer failed: {}", e)))?,
            None => Ok(()),
        }
    }

    /// Collect every line, failing if the operation failed.
    pub async fn collect(mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await {
            lines.push(line);
        }
        self.finish().await?;
        Ok(lines)
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        if let Some(handle) = self.producer.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for LineStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineStream").field("finished", &self.producer.is_none()).finish()
    }
}

/// An interactive exec session: output lines plus a writable input channel.
///
/// Closing the input or dropping the output releases the process.
pub struct ExecSession {
    pub output: LineStream,
    input: Option<mpsc::Sender<Vec<u8>>>,
}

impl ExecSession {
    pub fn new(output: LineStream, input: mpsc::Sender<Vec<u8>>) -> Self {
        Self { output, input: Some(input) }
    }

    /// Write raw bytes to the process's stdin.
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        match &self.input {
            Some(tx) => tx
                .send(data)
                .await
                .map_err(|_| StardeckError::Internal("exec input is closed".to_string())),
            None => Err(StardeckError::Internal("exec input is closed".to_string())),
        }
    }

    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// Split into the output stream and the input sender.
    pub fn split(self) -> (LineStream, Option<mpsc::Sender<Vec<u8>>>) {
        (self.output, self.input)
    }
}

/// How a streamed engine process is launched.
pub(crate) struct ProcessSpec<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    /// Operation name used in error messages.
    pub operation: String,
    /// Upper bound on the whole process; `None` for follow-style streams.
    pub timeout: Option<Duration>,
    pub buffer: usize,
}

/// Spawn a process and stream its stdout and stderr lines.
pub(crate) fn spawn_lines(spec: ProcessSpec<'_>) -> Result<LineStream> {
    let mut cmd = Command::new(spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn().map_err(|e| spawn_error(spec.program, e))?;
    Ok(stream_child(child, spec.operation, spec.timeout, spec.buffer, None))
}

/// Spawn an interactive process with a writable stdin.
pub(crate) fn spawn_interactive(spec: ProcessSpec<'_>) -> Result<ExecSession> {
    let mut cmd = Command::new(spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|e| spawn_error(spec.program, e))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| StardeckError::Internal("exec stdin not captured".to_string()))?;
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(spec.buffer.max(1));
    let (kill_tx, kill_rx) = oneshot::channel();

    tokio::spawn(async move {
        while let Some(data) = input_rx.recv().await {
            if let Err(e) = stdin.write_all(&data).await {
                debug!("exec stdin closed: {}", e);
                break;
            }
            let _ = stdin.flush().await;
        }
        drop(stdin);
        let _ = kill_tx.send(());
    });

    let output = stream_child(child, spec.operation, spec.timeout, spec.buffer, Some(kill_rx));
    Ok(ExecSession::new(output, input_tx))
}

pub(crate) fn spawn_error(program: &str, e: std::io::Error) -> StardeckError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StardeckError::EngineUnavailable {
            reason: format!("engine binary '{}' not found", program),
        }
    } else {
        StardeckError::EngineUnavailable {
            reason: format!("failed to run '{}': {}", program, e),
        }
    }
}

fn stream_child(
    mut child: tokio::process::Child,
    operation: String,
    timeout: Option<Duration>,
    buffer: usize,
    kill_rx: Option<oneshot::Receiver<()>>,
) -> LineStream {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let producer = tokio::spawn(async move {
        let op = operation.clone();
        let run = async move {
            let mut out = stdout.map(BufReader::new);
            let mut err = stderr.map(BufReader::new);
            let mut stderr_tail: Vec<String> = Vec::new();
            let mut kill_rx = kill_rx;

            while out.is_some() || err.is_some() {
                let line = tokio::select! {
                    line = next(&mut out), if out.is_some() => match line {
                        Some(line) => line,
                        None => { out = None; continue; }
                    },
                    line = next(&mut err), if err.is_some() => match line {
                        Some(line) => {
                            if stderr_tail.len() == STDERR_TAIL_LINES {
                                stderr_tail.remove(0);
                            }
                            stderr_tail.push(line.clone());
                            line
                        }
                        None => { err = None; continue; }
                    },
                    _ = wait_kill(&mut kill_rx), if kill_rx.is_some() => {
                        kill_rx = None;
                        let _ = child.start_kill();
                        continue;
                    }
                };
                if tx.send(line).await.is_err() {
                    let _ = child.start_kill();
                    return Err(StardeckError::Internal(format!("{}: consumer went away", operation)));
                }
            }

            let status = child.wait().await.map_err(|e| StardeckError::Engine {
                operation: operation.clone(),
                detail: e.to_string(),
            })?;
            if status.success() {
                Ok(())
            } else {
                let detail = stderr_tail.join("\n");
                warn!(operation = %operation, "engine process exited with {}", status);
                Err(super::docker::classify_failure(&operation, &detail))
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| StardeckError::Timeout { operation: op, seconds: limit.as_secs() })?,
            None => run.await,
        }
    });

    LineStream::new(rx, producer)
}

/// Next line from `reader`, decoded lossily so binary output never ends the stream.
async fn next<R>(reader: &mut Option<R>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let reader = reader.as_mut()?;
    let mut buf = Vec::new();
    match reader.read_until(b'\n', &mut buf).await {
        Ok(0) => None,
        Ok(_) => {
            if buf.last() == Some(&b'\n') {
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
            }
            Some(String::from_utf8_lossy(&buf).into_owned())
        }
        Err(e) => {
            debug!("engine output closed: {}", e);
            None
        }
    }
}

async fn wait_kill(rx: &mut Option<oneshot::Receiver<()>>) {
    match rx {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending().await,
    }
}
