use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};

use super::traits::{BoxFuture, ProcessSupervisor};

const READ_BUF: usize = 8 * 1024;
const CHUNK_QUEUE: usize = 64;

/// Wait channels that mean "sleeping in a read on a pipe or terminal".
const READ_WAIT_CHANNELS: &[&str] = &[
    "pipe_read",
    "pipe_wait",
    "n_tty_read",
    "wait_woken",
    "do_select",
    "do_sys_poll",
    "ep_poll",
];

/// Runs the agent as a child process with piped stdio.
pub struct PipeSupervisor {
    program: String,
    pid: Option<u32>,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    chunks: Mutex<mpsc::Receiver<Vec<u8>>>,
    watermark: Arc<AtomicU64>,
}

impl PipeSupervisor {
    pub fn spawn(program: &str, args: &[String], cwd: Option<&Path>) -> Result<Self> {
        if program.trim().is_empty() {
            bail!("no command given to supervise");
        }
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("spawn supervised command '{program}'"))?;

        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        let watermark = Arc::new(AtomicU64::new(0));
        if let Some(stdout) = child.stdout.take() {
            spawn_forwarder(stdout, tx.clone(), Arc::clone(&watermark));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_forwarder(stderr, tx, Arc::clone(&watermark));
        }
        let stdin = child.stdin.take();
        let pid = child.id();
        tracing::info!(program, pid = ?pid, "process.spawned");

        Ok(Self {
            program: program.to_string(),
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            chunks: Mutex::new(rx),
            watermark,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Exit code once the child has exited; `None` while it is running or
    /// when it was killed by a signal.
    pub async fn try_exit_code(&self) -> Result<Option<i32>> {
        let mut child = self.child.lock().await;
        Ok(child.try_wait()?.and_then(|status| status.code()))
    }
}

fn spawn_forwarder<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>, watermark: Arc<AtomicU64>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    watermark.fetch_add(n as u64, Ordering::SeqCst);
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "process.read_failed");
                    break;
                }
            }
        }
    });
}

impl ProcessSupervisor for PipeSupervisor {
    fn name(&self) -> &str {
        "pipe"
    }

    fn read_output(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.chunks.lock().await.recv().await) })
    }

    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut guard = self.stdin.lock().await;
            let Some(stdin) = guard.as_mut() else {
                bail!("stdin of '{}' is closed", self.program);
            };
            stdin.write_all(bytes).await?;
            stdin.flush().await?;
            Ok(())
        })
    }

    fn is_blocked_on_read(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match self.pid {
                Some(pid) => blocked_on_read(pid).await,
                None => false,
            }
        })
    }

    fn output_watermark(&self) -> u64 {
        self.watermark.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.stdin.lock().await.take();
            let mut child = self.child.lock().await;
            if child.try_wait()?.is_none() {
                child.kill().await.ok();
                child.wait().await.ok();
            }
            Ok(())
        })
    }
}

#[cfg(target_os = "linux")]
async fn blocked_on_read(pid: u32) -> bool {
    let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await;
    let wchan = tokio::fs::read_to_string(format!("/proc/{pid}/wchan")).await;
    match (stat, wchan) {
        (Ok(stat), Ok(wchan)) => is_read_wait(&stat, &wchan),
        _ => false,
    }
}

#[cfg(not(target_os = "linux"))]
async fn blocked_on_read(_pid: u32) -> bool {
    false
}

/// `stat` is `/proc/<pid>/stat`; the state letter follows the
/// parenthesised command name, which may itself contain spaces.
fn is_read_wait(stat: &str, wchan: &str) -> bool {
    let Some(state) = stat
        .rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
    else {
        return false;
    };
    state == "S" && READ_WAIT_CHANNELS.contains(&wchan.trim())
}
