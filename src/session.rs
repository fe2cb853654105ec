//! Device monitor session over a PTY.
//!
//! Spawns the monitor tool in a pseudo-terminal, exposes its console output
//! as a non-blocking [`ByteSource`], and writes the monitor's control keys
//! (restart, stop) back into the terminal.
//!
//! The PTY reader blocks, so a pump thread drains it into a channel. The
//! harness itself stays single-threaded: it only ever polls the channel.

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info, warn};

use crate::reader::{ByteSource, DEFAULT_CHUNK_SIZE};

/// Ctrl-T Ctrl-R: reset the target through the monitor.
pub const RESTART_SEQUENCE: [u8; 2] = [0x14, 0x12];

/// Ctrl-]: exit the monitor.
pub const STOP_SEQUENCE: [u8; 1] = [0x1D];

/// Monitor tool launched when nothing else is configured.
pub const DEFAULT_MONITOR_COMMAND: &str = "./freertos/vendors/espressif/esp-idf/tools/idf.py monitor";

/// Fire-and-forget control channel to the device monitor.
///
/// There is no acknowledgement: callers pace themselves with fixed sleeps.
pub trait DeviceControl {
    /// Write raw control bytes to the monitor.
    fn send_control(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Ask the monitor to reboot the device for the next trial.
    fn restart(&mut self) -> io::Result<()> {
        self.send_control(&RESTART_SEQUENCE)
    }

    /// Ask the monitor to exit.
    fn stop(&mut self) -> io::Result<()> {
        self.send_control(&STOP_SEQUENCE)
    }
}

/// How to launch the monitor.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Shell command line, run through `sh -c`.
    pub command: String,
    /// Largest chunk the pump reads from the PTY at once.
    pub chunk_size: usize,
    pub pty_size: PtySize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            command: DEFAULT_MONITOR_COMMAND.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            pty_size: PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            },
        }
    }
}

/// Live PTY session with the device monitor.
pub struct DeviceSession {
    // Held so the PTY stays open for the session's lifetime.
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    chunks: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pump_gone_reported: bool,
}

/// Command the PTY child runs: the monitor line under `sh -c`.
fn monitor_command(command: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new("sh");
    cmd.arg("-c");
    cmd.arg(command);
    if let Ok(cwd) = std::env::current_dir() {
        cmd.cwd(cwd);
    }
    cmd
}

/// Drain the blocking PTY reader into `tx` until the PTY closes.
fn spawn_pump(
    mut reader: Box<dyn Read + Send>,
    chunk_size: usize,
    tx: mpsc::Sender<Vec<u8>>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("pty-pump".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; chunk_size.max(1)];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO once the monitor exits and the slave side closes.
                        debug!("PTY read ended: {e}");
                        break;
                    }
                }
            }
        })
}

impl DeviceSession {
    /// Open a PTY, start the monitor inside it and begin draining its output.
    pub fn spawn(settings: &MonitorSettings) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(settings.pty_size)
            .context("failed to open PTY")?;

        info!(command = %settings.command, "spawning device monitor in PTY");
        let child = pair
            .slave
            .spawn_command(monitor_command(&settings.command))
            .with_context(|| format!("failed to spawn monitor `{}`", settings.command))?;

        // Only the master side is used from here on.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take PTY writer")?;

        // The pump is detached: it ends on its own when the PTY closes or
        // the session drops the receiving end.
        let (tx, rx) = mpsc::channel();
        spawn_pump(reader, settings.chunk_size, tx).context("failed to start PTY pump thread")?;

        Ok(Self {
            _master: pair.master,
            writer,
            child,
            chunks: rx,
            pending: Vec::new(),
            pump_gone_reported: false,
        })
    }

    /// OS process id of the monitor, when the platform exposes it.
    pub fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Whether the monitor process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait up to `grace` for the monitor to exit after [`stop`](DeviceControl::stop).
    ///
    /// Returns whether it exited. A monitor that ignores the stop key is left
    /// running and only logged.
    pub fn shutdown(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let exited = loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    info!(success = status.success(), "device monitor exited");
                    break true;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Ok(None) => break false,
                Err(e) => {
                    warn!("failed to poll device monitor: {e}");
                    break false;
                }
            }
        };
        if !exited {
            warn!(grace_ms = grace.as_millis() as u64, "device monitor still running after stop");
        }
        exited
    }
}

impl ByteSource for DeviceSession {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.chunks.try_recv() {
                Ok(chunk) => self.pending = chunk,
                Err(TryRecvError::Empty) => return Ok(0),
                Err(TryRecvError::Disconnected) => {
                    // The monitor is gone. Keep reporting "no data" and let
                    // the trial timeout decide.
                    if !self.pump_gone_reported {
                        warn!("device console closed; no further output will arrive");
                        self.pump_gone_reported = true;
                    }
                    return Ok(0);
                }
            }
        }

        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl DeviceControl for DeviceSession {
    fn send_control(&mut self, bytes: &[u8]) -> io::Result<()> {
        debug!(bytes = ?bytes, "sending control sequence to monitor");
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }
}
