//! Scripted target for testing control code against simulated devices.
//!
//! [`FakeTarget`] replaces a real machine with an in-memory file tree, scripted directory
//! listings, and scripted command outputs. Tests configure the initial device state with the
//! chainable `with_*` methods, exercise the code under test, then inspect the resulting state
//! and the [write journal][FakeTarget::writes].
//!
//! Failure injection:
//!
//! * [`with_rejected_write`][FakeTarget::with_rejected_write] makes a path refuse writes, as a
//!   read-only sysfs node would.
//! * [`with_sticky_file`][FakeTarget::with_sticky_file] accepts writes but never changes
//!   content, so verified writes fail with a mismatch.
//! * [`with_write_only_file`][FakeTarget::with_write_only_file] accepts writes but refuses
//!   reads, like `boostpulse`-style trigger nodes.
//!
//! # Example
//!
//! ```
//! use device_target::Target;
//! use device_target::fake::FakeTarget;
//! use futures::executor::block_on;
//!
//! let target = FakeTarget::new()
//!     .with_online([0, 1])
//!     .with_file("/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor", "ondemand");
//!
//! let governor = block_on(
//!     target.read_text("/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor"),
//! )
//! .unwrap();
//!
//! assert_eq!(governor, "ondemand");
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::{DeviceId, Error, IoErrorKind, Result, Target};

/// A record of one write accepted by a [`FakeTarget`], in acceptance order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteRecord {
    /// The path that was written.
    pub path: String,

    /// The value that was written.
    pub value: String,
}

/// An in-memory [`Target`] with scripted contents and failure injection.
#[derive(Debug, Default)]
pub struct FakeTarget {
    files: RefCell<BTreeMap<String, String>>,
    dirs: RefCell<BTreeMap<String, Vec<String>>>,
    commands: RefCell<BTreeMap<String, CommandScript>>,
    online: RefCell<BTreeSet<DeviceId>>,
    rejected_writes: RefCell<BTreeSet<String>>,
    sticky_files: RefCell<BTreeSet<String>>,
    write_only_files: RefCell<BTreeSet<String>>,
    writes: RefCell<Vec<WriteRecord>>,
    reads: RefCell<BTreeMap<String, usize>>,
}

#[derive(Clone, Debug)]
enum CommandScript {
    Succeed(String),
    Fail(String),
}

impl FakeTarget {
    /// Creates a target with no files, no directories, no commands and no online devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a readable and writable file with the given initial content.
    #[must_use]
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .borrow_mut()
            .insert(path.to_string(), content.to_string());
        self
    }

    /// Adds a directory with the given entry names.
    #[must_use]
    pub fn with_dir(self, path: &str, entries: &[&str]) -> Self {
        self.dirs.borrow_mut().insert(
            path.to_string(),
            entries.iter().map(ToString::to_string).collect(),
        );
        self
    }

    /// Scripts a command to succeed with the given stdout.
    #[must_use]
    pub fn with_command(self, command: &str, stdout: &str) -> Self {
        self.commands.borrow_mut().insert(
            command.to_string(),
            CommandScript::Succeed(stdout.to_string()),
        );
        self
    }

    /// Scripts a command to fail with the given message.
    #[must_use]
    pub fn with_failing_command(self, command: &str, message: &str) -> Self {
        self.commands
            .borrow_mut()
            .insert(command.to_string(), CommandScript::Fail(message.to_string()));
        self
    }

    /// Sets the online device set.
    #[must_use]
    pub fn with_online(self, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        *self.online.borrow_mut() = devices.into_iter().collect();
        self
    }

    /// Makes a path refuse writes, as a read-only sysfs node would.
    #[must_use]
    pub fn with_rejected_write(self, path: &str) -> Self {
        self.reject_writes(path);
        self
    }

    /// Makes a file accept writes without changing content, so verified writes mismatch.
    #[must_use]
    pub fn with_sticky_file(self, path: &str, content: &str) -> Self {
        self.sticky_files.borrow_mut().insert(path.to_string());
        self.with_file(path, content)
    }

    /// Adds a file that accepts writes but refuses reads, like trigger nodes do.
    #[must_use]
    pub fn with_write_only_file(self, path: &str) -> Self {
        self.write_only_files.borrow_mut().insert(path.to_string());
        self.with_file(path, "")
    }

    /// Makes a path refuse writes from this point on. Usable mid-test, unlike the
    /// [`with_rejected_write`][Self::with_rejected_write] builder form.
    pub fn reject_writes(&self, path: &str) {
        self.rejected_writes.borrow_mut().insert(path.to_string());
    }

    /// Current content of a file, if present.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<String> {
        self.files.borrow().get(path).cloned()
    }

    /// Every write accepted so far, in acceptance order.
    #[must_use]
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.borrow().clone()
    }

    /// Accepted writes to one specific path, in acceptance order.
    #[must_use]
    pub fn writes_to(&self, path: &str) -> Vec<String> {
        self.writes
            .borrow()
            .iter()
            .filter(|record| record.path == path)
            .map(|record| record.value.clone())
            .collect()
    }

    /// How many times a path has been read.
    #[must_use]
    pub fn read_count(&self, path: &str) -> usize {
        self.reads.borrow().get(path).copied().unwrap_or(0)
    }

    fn record_read(&self, path: &str) {
        *self.reads.borrow_mut().entry(path.to_string()).or_insert(0) += 1;
    }

    fn not_found(path: &str) -> Error {
        Error::Io {
            path: path.to_string(),
            kind: IoErrorKind::NotFound,
            message: "no such device node".to_string(),
        }
    }
}

impl Target for FakeTarget {
    async fn read_text(&self, path: &str) -> Result<String> {
        self.record_read(path);

        if self.write_only_files.borrow().contains(path) {
            return Err(Error::Io {
                path: path.to_string(),
                kind: IoErrorKind::Other,
                message: "node is write-only".to_string(),
            });
        }

        self.files
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| Self::not_found(path))
    }

    async fn write_text(&self, path: &str, value: &str, verify: bool) -> Result<()> {
        if self.rejected_writes.borrow().contains(path) {
            return Err(Error::Io {
                path: path.to_string(),
                kind: IoErrorKind::PermissionDenied,
                message: "write rejected".to_string(),
            });
        }

        if !self.files.borrow().contains_key(path) {
            return Err(Self::not_found(path));
        }

        self.writes.borrow_mut().push(WriteRecord {
            path: path.to_string(),
            value: value.to_string(),
        });

        if !self.sticky_files.borrow().contains(path) {
            self.files
                .borrow_mut()
                .insert(path.to_string(), value.to_string());
        }

        if verify {
            let observed = self.read_text(path).await?;

            if observed != value {
                return Err(Error::VerifyMismatch {
                    path: path.to_string(),
                    written: value.to_string(),
                    observed,
                });
            }
        }

        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        self.dirs
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| Self::not_found(path))
    }

    async fn run_command(
        &self,
        command: &str,
        _as_root: bool,
        _timeout: Duration,
    ) -> Result<String> {
        match self.commands.borrow().get(command) {
            Some(CommandScript::Succeed(stdout)) => Ok(stdout.clone()),
            Some(CommandScript::Fail(message)) => Err(Error::Command {
                command: command.to_string(),
                message: message.clone(),
                timed_out: false,
            }),
            None => Err(Error::Command {
                command: command.to_string(),
                message: "command not scripted".to_string(),
                timed_out: false,
            }),
        }
    }

    async fn online_devices(&self) -> Result<BTreeSet<DeviceId>> {
        Ok(self.online.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;

    #[test]
    fn reads_and_writes_round_trip() {
        let target = FakeTarget::new().with_file("/sys/x", "before");

        block_on(target.write_text("/sys/x", "after", true)).unwrap();

        assert_eq!(block_on(target.read_text("/sys/x")).unwrap(), "after");
        assert_eq!(target.writes_to("/sys/x"), vec!["after"]);
    }

    #[test]
    fn missing_path_fails_reads_and_writes() {
        let target = FakeTarget::new();

        let read = block_on(target.read_text("/sys/x")).unwrap_err();
        let write = block_on(target.write_text("/sys/x", "1", false)).unwrap_err();

        assert_eq!(read.io_kind(), Some(IoErrorKind::NotFound));
        assert_eq!(write.io_kind(), Some(IoErrorKind::NotFound));
    }

    #[test]
    fn rejected_write_fails_without_changing_content() {
        let target = FakeTarget::new()
            .with_file("/sys/x", "before")
            .with_rejected_write("/sys/x");

        let error = block_on(target.write_text("/sys/x", "after", false)).unwrap_err();

        assert_eq!(error.io_kind(), Some(IoErrorKind::PermissionDenied));
        assert_eq!(target.file("/sys/x").unwrap(), "before");
        assert!(target.writes().is_empty());
    }

    #[test]
    fn sticky_file_fails_verified_writes() {
        let target = FakeTarget::new().with_sticky_file("/sys/x", "stuck");

        let error = block_on(target.write_text("/sys/x", "changed", true)).unwrap_err();

        assert!(matches!(error, Error::VerifyMismatch { .. }));
        assert_eq!(target.file("/sys/x").unwrap(), "stuck");
    }

    #[test]
    fn write_only_file_accepts_writes_but_refuses_reads() {
        let target = FakeTarget::new().with_write_only_file("/sys/boostpulse");

        block_on(target.write_text("/sys/boostpulse", "1", false)).unwrap();
        let error = block_on(target.read_text("/sys/boostpulse")).unwrap_err();

        assert_eq!(target.writes_to("/sys/boostpulse"), vec!["1"]);
        assert_eq!(error.io_kind(), Some(IoErrorKind::Other));
    }

    #[test]
    fn read_counts_accumulate_per_path() {
        let target = FakeTarget::new().with_file("/sys/x", "1");

        block_on(target.read_text("/sys/x")).unwrap();
        block_on(target.read_text("/sys/x")).unwrap();

        assert_eq!(target.read_count("/sys/x"), 2);
        assert_eq!(target.read_count("/sys/y"), 0);
    }

    #[test]
    fn unscripted_command_fails() {
        let target = FakeTarget::new();

        let error =
            block_on(target.run_command("true", false, Duration::from_secs(1))).unwrap_err();

        assert!(matches!(error, Error::Command { timed_out: false, .. }));
    }
}
