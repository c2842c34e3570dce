use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The narrow view the runtime has of a supervised process.
///
/// Implementations must tolerate concurrent use: the output reader, the
/// input relay, the executor and the watchdog each hold the same handle.
pub trait ProcessSupervisor: Send + Sync {
    fn name(&self) -> &str;

    /// Next raw output chunk (stdout and stderr interleaved); `None` once
    /// the process has closed its output.
    fn read_output(&self) -> BoxFuture<'_, anyhow::Result<Option<Vec<u8>>>>;

    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Whether the process is currently parked waiting for input.
    fn is_blocked_on_read(&self) -> BoxFuture<'_, bool>;

    /// Total output bytes produced so far; used to tell whether the process
    /// moved on after an injection.
    fn output_watermark(&self) -> u64;

    /// Ask the process to exit. Idempotent.
    fn terminate(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}
