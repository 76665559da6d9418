use std::collections::BTreeSet;
use std::fs;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::{DeviceId, Error, Result, Target};

/// Path of the kernel's online-CPU mask, in cpulist format.
const ONLINE_DEVICES_PATH: &str = "/sys/devices/system/cpu/online";

/// How often a running command is checked for completion while its timeout has not elapsed.
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The locally-attached machine.
///
/// Device paths resolve against the local virtual filesystem and commands run in a local shell.
/// The I/O inside these methods is synchronous and blocking: virtual-filesystem access never
/// touches a real storage device and hits a fast path in the OS, so there is nothing to wait on
/// asynchronously.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalTarget;

impl LocalTarget {
    /// Creates a handle to the locally-attached machine.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Target for LocalTarget {
    async fn read_text(&self, path: &str) -> Result<String> {
        fs::read_to_string(path)
            .map(|content| content.trim().to_string())
            .map_err(|error| Error::io(path, &error))
    }

    async fn write_text(&self, path: &str, value: &str, verify: bool) -> Result<()> {
        fs::write(path, value).map_err(|error| Error::io(path, &error))?;

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
        let entries = fs::read_dir(path).map_err(|error| Error::io(path, &error))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| Error::io(path, &error))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }

        // read_dir order is arbitrary; callers get a stable order.
        names.sort();
        Ok(names)
    }

    async fn run_command(&self, command: &str, as_root: bool, timeout: Duration) -> Result<String> {
        tracing::debug!(command, as_root, "running device command");

        let mut invocation = if as_root {
            let mut invocation = Command::new("sudo");
            invocation.arg("sh");
            invocation
        } else {
            Command::new("sh")
        };

        let mut child = invocation
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| Error::Command {
                command: command.to_string(),
                message: format!("failed to start: {error}"),
                timed_out: false,
            })?;

        let started = Instant::now();

        loop {
            let exited = child.try_wait().map_err(|error| Error::Command {
                command: command.to_string(),
                message: format!("failed to await: {error}"),
                timed_out: false,
            })?;

            if exited.is_some() {
                break;
            }

            if started.elapsed() >= timeout {
                // Best effort; the command error is reported either way.
                drop(child.kill());
                drop(child.wait());

                return Err(Error::Command {
                    command: command.to_string(),
                    message: format!("timed out after {timeout:?}"),
                    timed_out: true,
                });
            }

            std::thread::sleep(COMMAND_POLL_INTERVAL);
        }

        let output = child.wait_with_output().map_err(|error| Error::Command {
            command: command.to_string(),
            message: format!("failed to collect output: {error}"),
            timed_out: false,
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);

            Err(Error::Command {
                command: command.to_string(),
                message: format!("exited with {}: {}", output.status, stderr.trim()),
                timed_out: false,
            })
        }
    }

    async fn online_devices(&self) -> Result<BTreeSet<DeviceId>> {
        let mask = self.read_text(ONLINE_DEVICES_PATH).await?;

        let devices = cpulist::parse(&mask).map_err(|_| Error::Parse {
            path: ONLINE_DEVICES_PATH.to_string(),
            expected: "a cpulist",
            content: mask,
        })?;

        Ok(devices.into_iter().collect())
    }
}
