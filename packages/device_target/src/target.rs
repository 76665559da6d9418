use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use crate::{Error, Result};

/// Identifies a controllable device unit (a CPU core).
///
/// This matches the numeric identifier used by the operating system's own tooling. Values are
/// not guaranteed to be sequential or to start from zero.
pub type DeviceId = u32;

/// The complete set of primitives that control code needs from a machine.
///
/// Implementations provide access to the machine's virtual device filesystem and command
/// execution. Every method is a suspension point: coordination layers interleave concurrent
/// work at exactly these boundaries, and nowhere else.
///
/// Implementations are consumed through generics rather than trait objects, so native async
/// methods are used directly.
pub trait Target {
    /// Reads the trimmed text content of a device path.
    ///
    /// Fails with a stable error if the path is absent or unreadable.
    fn read_text(&self, path: &str) -> impl Future<Output = Result<String>>;

    /// Writes `value` to a device path.
    ///
    /// With `verify`, the path is read back after the write and the call fails with
    /// [`Error::VerifyMismatch`] if the observed value diverges from the written one. Writes to
    /// nodes that cannot be read back must pass `verify = false`.
    fn write_text(&self, path: &str, value: &str, verify: bool)
    -> impl Future<Output = Result<()>>;

    /// Reads a device path and parses its content as an integer.
    fn read_int(&self, path: &str) -> impl Future<Output = Result<u64>> {
        async move {
            let content = self.read_text(path).await?;

            content.trim().parse().map_err(|_| Error::Parse {
                path: path.to_string(),
                expected: "an integer",
                content,
            })
        }
    }

    /// Lists the entry names of a device directory, in a stable order.
    fn list_dir(&self, path: &str) -> impl Future<Output = Result<Vec<String>>>;

    /// Runs a shell command on the device and returns its stdout.
    ///
    /// Fails with a stable error on non-zero exit or when `timeout` elapses; a timeout is
    /// reported with the `timed_out` flag set and is not retryable by default.
    fn run_command(
        &self,
        command: &str,
        as_root: bool,
        timeout: Duration,
    ) -> impl Future<Output = Result<String>>;

    /// The set of devices currently online.
    fn online_devices(&self) -> impl Future<Output = Result<BTreeSet<DeviceId>>>;
}
