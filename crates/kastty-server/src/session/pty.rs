//! Terminal process collaborator.
//!
//! The session only needs to write input, resize, and kill the process,
//! plus two event streams: output chunks and a single exit code. Those
//! are expressed as the [`ProcessHandle`] trait and the channels in
//! [`SpawnedProcess`]; [`PtySpawner`] provides them with portable-pty.

use kastty_core::{KasttyError, KasttyResult};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Output chunks buffered between the reader thread and the session.
const OUTPUT_QUEUE_DEPTH: usize = 64;
/// Input chunks buffered for the writer thread; beyond this, input is dropped.
const INPUT_QUEUE_DEPTH: usize = 64;
const READ_BUF_SIZE: usize = 8192;

/// What to run and how big its terminal starts out.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment, layered over the inherited one.
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Control surface of a running terminal process.
pub trait ProcessHandle: Send + Sync {
    /// Send bytes to the process's input.
    fn write(&self, data: &[u8]) -> KasttyResult<()>;

    /// Change the terminal size.
    fn resize(&self, cols: u16, rows: u16) -> KasttyResult<()>;

    /// Forcibly terminate the process.
    fn kill(&self) -> KasttyResult<()>;
}

/// A started process: its control handle plus its output and exit streams.
pub struct SpawnedProcess {
    pub handle: Arc<dyn ProcessHandle>,
    /// Output chunks in emission order; closes at EOF.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Resolves once with the exit code.
    pub exit: oneshot::Receiver<i32>,
}

/// Starts terminal processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &ProcessSpec) -> KasttyResult<SpawnedProcess>;
}

/// Spawns processes on a native pseudo-terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl ProcessSpawner for PtySpawner {
    fn spawn(&self, spec: &ProcessSpec) -> KasttyResult<SpawnedProcess> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| KasttyError::Process(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| KasttyError::Process(format!("failed to spawn {}: {e}", spec.command)))?;
        // Only the child should hold the slave side, so reads hit EOF when it exits.
        drop(pair.slave);

        let pid = child.process_id();
        info!(command = %spec.command, pid, cols = spec.cols, rows = spec.rows, "PTY spawned");

        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| KasttyError::Process(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| KasttyError::Process(format!("failed to take PTY writer: {e}")))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("kastty-pty-reader".into())
            .spawn(move || read_loop(reader, output_tx))?;

        let (input, input_rx) = PtyInput::new(INPUT_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("kastty-pty-writer".into())
            .spawn(move || write_loop(writer, input_rx))?;

        let (exit_tx, exit_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("kastty-pty-wait".into())
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        warn!(error = %e, "wait on PTY child failed");
                        -1
                    }
                };
                info!(code, "PTY child exited");
                let _ = exit_tx.send(code);
            })?;

        let handle = PtyHandle {
            input,
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
        };

        Ok(SpawnedProcess {
            handle: Arc::new(handle),
            output: output_rx,
            exit: exit_rx,
        })
    }
}

/// Bounded input queue in front of the writer thread.
///
/// Never blocks: when a child stops reading and the queue fills up, further
/// input is rejected instead of buffered.
struct PtyInput {
    tx: std_mpsc::SyncSender<Vec<u8>>,
}

impl PtyInput {
    fn new(depth: usize) -> (Self, std_mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = std_mpsc::sync_channel(depth);
        (Self { tx }, rx)
    }

    fn send(&self, data: &[u8]) -> KasttyResult<()> {
        self.tx.try_send(data.to_vec()).map_err(|e| match e {
            std_mpsc::TrySendError::Full(_) => KasttyError::Process(format!(
                "PTY input queue full, dropped {} bytes",
                data.len()
            )),
            std_mpsc::TrySendError::Disconnected(_) => KasttyError::Process("PTY input closed".into()),
        })
    }
}

/// Control handle for a PTY-backed child.
pub struct PtyHandle {
    input: PtyInput,
    /// The master for resize operations (Mutex because MasterPty is not Sync).
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl ProcessHandle for PtyHandle {
    fn write(&self, data: &[u8]) -> KasttyResult<()> {
        self.input.send(data)
    }

    fn resize(&self, cols: u16, rows: u16) -> KasttyResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self
            .master
            .lock()
            .map_err(|_| KasttyError::Process("PTY master lock poisoned".into()))?;
        master
            .resize(size)
            .map_err(|e| KasttyError::Process(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn kill(&self) -> KasttyResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| KasttyError::Process("PTY killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| KasttyError::Process(format!("kill failed: {e}")))
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, output: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the child side is gone.
                debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }
    debug!("PTY reader finished");
}

fn write_loop(mut writer: Box<dyn Write + Send>, input: std_mpsc::Receiver<Vec<u8>>) {
    while let Ok(data) = input.recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            warn!(error = %e, "PTY write failed");
            break;
        }
    }
    debug!("PTY writer finished");
}
