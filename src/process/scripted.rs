use anyhow::{Result, bail};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::traits::{BoxFuture, ProcessSupervisor};

type WriteHook = Box<dyn Fn(usize) + Send + Sync>;

/// A supervisor whose output, read state and reaction to writes are
/// driven by the caller.
///
/// Writes are recorded. With [`ScriptedSupervisor::advance_on_write`] a
/// write unblocks the "process" and bumps the watermark, which is what a
/// real agent does when it accepts an answer.
pub struct ScriptedSupervisor {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    blocked: AtomicBool,
    advance_on_write: AtomicBool,
    failing_writes: AtomicU32,
    watermark: AtomicU64,
    writes: Mutex<Vec<Vec<u8>>>,
    on_write: Mutex<Option<WriteHook>>,
    terminated: AtomicBool,
}

impl Default for ScriptedSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSupervisor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            blocked: AtomicBool::new(false),
            advance_on_write: AtomicBool::new(false),
            failing_writes: AtomicU32::new(0),
            watermark: AtomicU64::new(0),
            writes: Mutex::new(Vec::new()),
            on_write: Mutex::new(None),
            terminated: AtomicBool::new(false),
        }
    }

    /// Queue an output chunk as if the process printed it.
    pub fn emit(&self, text: &str) {
        self.watermark
            .fetch_add(text.len() as u64, Ordering::SeqCst);
        if let Some(tx) = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = tx.send(text.as_bytes().to_vec());
        }
    }

    /// End of output; `read_output` returns `None` once the queue drains.
    pub fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn advance_on_write(&self, advance: bool) {
        self.advance_on_write.store(advance, Ordering::SeqCst);
    }

    /// Fail the next `count` writes.
    pub fn fail_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Called with the 1-based write count after every recorded write.
    pub fn on_write(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_write.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl ProcessSupervisor for ScriptedSupervisor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn read_output(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.rx.lock().await.recv().await) })
    }

    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.terminated.load(Ordering::SeqCst) {
                bail!("scripted process terminated");
            }
            let failing = self.failing_writes.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_writes.store(failing - 1, Ordering::SeqCst);
                bail!("scripted write failure");
            }

            let count = {
                let mut writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
                writes.push(bytes.to_vec());
                writes.len()
            };
            if self.advance_on_write.load(Ordering::SeqCst) {
                self.blocked.store(false, Ordering::SeqCst);
                self.watermark.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(hook) = self
                .on_write
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
            {
                hook(count);
            }
            Ok(())
        })
    }

    fn is_blocked_on_read(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.blocked.load(Ordering::SeqCst) })
    }

    fn output_watermark(&self) -> u64 {
        self.watermark.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.terminated.store(true, Ordering::SeqCst);
            self.close();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_output_is_read_in_order_then_closes() {
        let sup = ScriptedSupervisor::new();
        sup.emit("one ");
        sup.emit("two");
        sup.close();
        assert_eq!(sup.read_output().await.unwrap().unwrap(), b"one ");
        assert_eq!(sup.read_output().await.unwrap().unwrap(), b"two");
        assert!(sup.read_output().await.unwrap().is_none());
        assert_eq!(sup.output_watermark(), 7);
    }

    #[tokio::test]
    async fn advancing_write_unblocks() {
        let sup = ScriptedSupervisor::new();
        sup.set_blocked(true);
        sup.advance_on_write(true);
        sup.write(b"y\n").await.unwrap();
        assert!(!sup.is_blocked_on_read().await);
        assert_eq!(sup.writes(), vec!["y\n".to_string()]);
    }

    #[tokio::test]
    async fn failing_writes_are_not_recorded() {
        let sup = ScriptedSupervisor::new();
        sup.fail_writes(1);
        assert!(sup.write(b"y\n").await.is_err());
        sup.write(b"y\n").await.unwrap();
        assert_eq!(sup.writes().len(), 1);
    }
}
