//! PTY host - spawn, feed and kill children bound to a pseudo-terminal.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Context, Result};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Minimum terminal size propagated to children.
pub const MIN_COLS: u16 = 40;
pub const MIN_ROWS: u16 = 10;

/// What to spawn and how.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Extra environment on top of the inherited one.
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// Events delivered from the PTY reader and exit watcher.
#[derive(Debug, Clone)]
pub enum PtyEvent {
    /// Raw bytes as the OS delivered them.
    Data(Vec<u8>),
    Exit { code: i32, signal: Option<i32> },
}

/// Handle to a running PTY child.
pub struct PtyHandle {
    pub pid: Option<u32>,
    writer: StdMutex<Box<dyn Write + Send>>,
    master: StdMutex<Box<dyn MasterPty + Send>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    running: Arc<AtomicBool>,
    event_tx: broadcast::Sender<PtyEvent>,
}

impl PtyHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PtyEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Write raw bytes to the child's terminal.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(anyhow!("child is not running"));
        }
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(data)?;
        writer.flush()?;
        debug!(len = data.len(), "wrote to PTY");
        Ok(())
    }

    /// Propagate a resize to the child's TTY, clamped to the minimum size.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let size = PtySize {
            rows: rows.max(MIN_ROWS),
            cols: cols.max(MIN_COLS),
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resize(size)
            .context("resizing PTY")
    }

    /// Best-effort terminate the child.
    pub fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut killer = self.killer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = killer.kill() {
            debug!(error = %e, "kill failed (child may already be gone)");
        }
    }
}

/// Spawn a child attached to a fresh PTY. The inherited environment is
/// copied in full, `TERM` is forced, and `CLAUDECODE` is stripped so a
/// supervised claude CLI does not refuse to nest.
///
/// Must be called inside a tokio runtime; the reader and exit watcher run
/// as background tasks.
pub fn spawn(spec: SpawnSpec) -> Result<PtyHandle> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: spec.rows.max(MIN_ROWS),
            cols: spec.cols.max(MIN_COLS),
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("opening PTY")?;

    let mut cmd = CommandBuilder::new(&spec.command);
    cmd.args(&spec.args);
    cmd.cwd(&spec.cwd);
    // portable-pty starts from an empty environment; copy everything.
    for (key, value) in std::env::vars() {
        cmd.env(key, value);
    }
    cmd.env("TERM", "xterm-256color");
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    cmd.env_remove("CLAUDECODE");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("spawning {}", spec.command))?;
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();
    let writer = pair.master.take_writer().context("taking PTY writer")?;
    let reader = pair.master.try_clone_reader().context("cloning PTY reader")?;

    let (event_tx, _) = broadcast::channel(1024);
    let running = Arc::new(AtomicBool::new(true));

    info!(command = %spec.command, pid = ?pid, "PTY spawned");

    // Reader: blocking reads bridged into the async world.
    let read_tx = event_tx.clone();
    let read_running = Arc::clone(&running);
    tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = [0u8; 4096];
        while read_running.load(Ordering::SeqCst) {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = read_tx.send(PtyEvent::Data(buf[..n].to_vec()));
                }
                Err(e) => {
                    if read_running.load(Ordering::SeqCst) {
                        error!(error = %e, "PTY read error");
                    }
                    break;
                }
            }
        }
    });

    // Exit watcher.
    let exit_tx = event_tx.clone();
    let exit_running = Arc::clone(&running);
    tokio::spawn(async move {
        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .ok()
            .and_then(|r| r.ok());
        let code = status.map(|s| s.exit_code() as i32).unwrap_or(-1);
        exit_running.store(false, Ordering::SeqCst);
        info!(exit_code = code, "PTY child exited");
        let _ = exit_tx.send(PtyEvent::Exit { code, signal: None });
    });

    Ok(PtyHandle {
        pid,
        writer: StdMutex::new(writer),
        master: StdMutex::new(pair.master),
        killer: StdMutex::new(killer),
        running,
        event_tx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn collect_until_exit(handle: &PtyHandle) -> (String, i32) {
        let mut rx = handle.subscribe();
        let mut output = String::new();
        let code = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(PtyEvent::Data(bytes)) => {
                        output.push_str(&String::from_utf8_lossy(&bytes))
                    }
                    Ok(PtyEvent::Exit { code, .. }) => return code,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return -1,
                }
            }
        })
        .await
        .expect("child did not exit in time");
        (output, code)
    }

    #[tokio::test]
    async fn test_spawn_streams_output_and_exit() {
        let handle = spawn(SpawnSpec {
            command: "sh".into(),
            args: vec!["-c".into(), "printf 'hello from pty'".into()],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            cols: 80,
            rows: 24,
        })
        .unwrap();
        let (output, code) = collect_until_exit(&handle).await;
        assert!(output.contains("hello from pty"), "output: {:?}", output);
        assert_eq!(code, 0);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_claudecode_env_is_stripped() {
        let mut env = HashMap::new();
        env.insert("CLAUDECODE".to_string(), "1".to_string());
        let handle = spawn(SpawnSpec {
            command: "sh".into(),
            args: vec!["-c".into(), "printf \"CC=${CLAUDECODE:-unset}\"".into()],
            cwd: std::env::temp_dir(),
            env,
            cols: 80,
            rows: 24,
        })
        .unwrap();
        let (output, _) = collect_until_exit(&handle).await;
        assert!(output.contains("CC=unset"), "output: {:?}", output);
    }

    #[tokio::test]
    async fn test_write_reaches_child() {
        let handle = spawn(SpawnSpec {
            command: "sh".into(),
            args: vec!["-c".into(), "read line; printf \"got:%s\" \"$line\"".into()],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            cols: 80,
            rows: 24,
        })
        .unwrap();
        handle.write(b"ping\n").unwrap();
        let (output, _) = collect_until_exit(&handle).await;
        assert!(output.contains("got:ping"), "output: {:?}", output);
    }

    #[tokio::test]
    async fn test_kill_terminates_child() {
        let handle = spawn(SpawnSpec {
            command: "sh".into(),
            args: vec!["-c".into(), "sleep 30".into()],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            cols: 80,
            rows: 24,
        })
        .unwrap();
        handle.kill();
        let (_, code) = collect_until_exit(&handle).await;
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let result = spawn(SpawnSpec {
            command: "definitely-not-a-real-binary-xyz".into(),
            args: vec![],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            cols: 80,
            rows: 24,
        });
        assert!(result.is_err());
    }
}
