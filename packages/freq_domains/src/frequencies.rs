use std::collections::{BTreeMap, BTreeSet};

use device_target::{DeviceId, IoErrorKind, Target};
use interleave::concurrently;

use crate::policies::{COMMAND_TIMEOUT, MANUAL_FREQUENCY_GOVERNOR, device_path};
use crate::{Cpufreq, Error, Result};

impl<T> Cpufreq<T>
where
    T: Target + 'static,
{
    /// The frequencies this device's policy supports, ascending. Cached.
    ///
    /// An empty list means the driver does not enumerate its frequencies (the Intel P-State
    /// driver, notably); it does not mean the device cannot change frequency.
    pub async fn frequencies(&self, device: DeviceId) -> Result<Vec<u64>> {
        let target = self.target_handle();

        self.frequencies_cache()
            .get_or_compute(device, async move || {
                let path = device_path(device, "scaling_available_frequencies");

                // The node is root-readable on some devices, so go through a command
                // rather than a plain read.
                if let Ok(output) = target
                    .run_command(&format!("cat {path}"), false, COMMAND_TIMEOUT)
                    .await
                {
                    let mut frequencies = parse_frequencies(&path, &output)?;
                    frequencies.sort_unstable();
                    return Ok(frequencies);
                }

                // Drivers that omit the node still expose the frequencies they have
                // visited in the time-in-state statistics.
                let stats = device_path(device, "stats/time_in_state");

                match target.read_text(&stats).await {
                    Ok(content) => {
                        let mut frequencies = content
                            .lines()
                            .filter_map(|line| line.split_whitespace().next())
                            .map(|entry| parse_frequency(&stats, entry))
                            .collect::<Result<Vec<u64>>>()?;
                        frequencies.sort_unstable();
                        Ok(frequencies)
                    }
                    Err(error) if error.io_kind() == Some(IoErrorKind::NotFound) => Ok(Vec::new()),
                    Err(error) => Err(error.into()),
                }
            })
            .await
    }

    /// The largest supported frequency, or `None` when frequencies cannot be enumerated.
    pub async fn max_available_frequency(&self, device: DeviceId) -> Result<Option<u64>> {
        Ok(self.frequencies(device).await?.last().copied())
    }

    /// The smallest supported frequency, or `None` when frequencies cannot be enumerated.
    pub async fn min_available_frequency(&self, device: DeviceId) -> Result<Option<u64>> {
        Ok(self.frequencies(device).await?.first().copied())
    }

    /// The frequency this device's policy is currently running at, in kHz.
    ///
    /// With `from_hardware` the value comes from the hardware register rather than the
    /// scaling layer's bookkeeping; that node needs elevated privileges on most devices.
    pub async fn frequency(&self, device: DeviceId, from_hardware: bool) -> Result<u64> {
        let leaf = if from_hardware {
            "cpuinfo_cur_freq"
        } else {
            "scaling_cur_freq"
        };

        Ok(self.target().read_int(&device_path(device, leaf)).await?)
    }

    /// Pins this device's policy to `frequency`, in kHz.
    ///
    /// Manual frequency control requires the manual governor to be active; any other
    /// governor would immediately override the setting, so the call refuses instead.
    /// With `exact`, the frequency must be one the policy enumerates.
    ///
    /// The kernel silently clamps values outside the policy limits; a clamped outcome is
    /// logged rather than treated as a failure.
    pub async fn set_frequency(
        &self,
        device: DeviceId,
        frequency: u64,
        exact: bool,
    ) -> Result<()> {
        if exact {
            let supported = self.frequencies(device).await?;

            if !supported.is_empty() && !supported.contains(&frequency) {
                return Err(Error::UnsupportedFrequency {
                    device,
                    frequency,
                    supported,
                });
            }
        }

        let active = self.governor(device).await?;

        if active != MANUAL_FREQUENCY_GOVERNOR {
            return Err(Error::GovernorRequired {
                device,
                required: MANUAL_FREQUENCY_GOVERNOR,
                active,
            });
        }

        // No read-back verification: the written value and the resulting frequency
        // legitimately differ when the kernel clamps.
        self.target()
            .write_text(
                &device_path(device, "scaling_setspeed"),
                &frequency.to_string(),
                false,
            )
            .await?;

        let observed = self.frequency(device, true).await?;

        if observed != frequency {
            tracing::warn!(
                device,
                requested = frequency,
                observed,
                "requested frequency was not applied"
            );
        }

        Ok(())
    }

    /// Pins every listed device's policy to `frequency`, concurrently.
    pub async fn set_frequency_for(
        &self,
        devices: &BTreeSet<DeviceId>,
        frequency: u64,
        exact: bool,
    ) -> Result<()> {
        concurrently(
            devices
                .iter()
                .map(|&device| self.set_frequency(device, frequency, exact)),
        )
        .await?;

        Ok(())
    }

    /// The lower frequency limit of this device's policy, in kHz.
    pub async fn min_frequency(&self, device: DeviceId) -> Result<u64> {
        Ok(self
            .target()
            .read_int(&device_path(device, "scaling_min_freq"))
            .await?)
    }

    /// Sets the lower frequency limit of this device's policy.
    pub async fn set_min_frequency(
        &self,
        device: DeviceId,
        frequency: u64,
        exact: bool,
    ) -> Result<()> {
        self.set_frequency_limit(device, "scaling_min_freq", frequency, exact)
            .await
    }

    /// The upper frequency limit of this device's policy, in kHz.
    pub async fn max_frequency(&self, device: DeviceId) -> Result<u64> {
        Ok(self
            .target()
            .read_int(&device_path(device, "scaling_max_freq"))
            .await?)
    }

    /// Sets the upper frequency limit of this device's policy.
    pub async fn set_max_frequency(
        &self,
        device: DeviceId,
        frequency: u64,
        exact: bool,
    ) -> Result<()> {
        self.set_frequency_limit(device, "scaling_max_freq", frequency, exact)
            .await
    }

    async fn set_frequency_limit(
        &self,
        device: DeviceId,
        leaf: &str,
        frequency: u64,
        exact: bool,
    ) -> Result<()> {
        if exact {
            let supported = self.frequencies(device).await?;

            if !supported.is_empty() && !supported.contains(&frequency) {
                return Err(Error::UnsupportedFrequency {
                    device,
                    frequency,
                    supported,
                });
            }
        }

        self.target()
            .write_text(&device_path(device, leaf), &frequency.to_string(), true)
            .await?;

        Ok(())
    }

    /// The active governor of every device, read in one shell round trip.
    pub async fn all_governors(&self) -> Result<BTreeMap<DeviceId, String>> {
        let output = self
            .target()
            .run_command("cpufreq_get_all_governors", true, COMMAND_TIMEOUT)
            .await?;

        Ok(parse_per_device_listing(&output))
    }

    /// Switches every device to `governor` in one shell round trip.
    ///
    /// The shell utility cannot say which device rejected a governor, so on failure the
    /// per-device support lists are probed and the failure is reported structurally when
    /// unsupported devices are the cause.
    pub async fn set_all_governors(&self, governor: &str) -> Result<()> {
        let outcome = self
            .target()
            .run_command(
                &format!("cpufreq_set_all_governors {governor}"),
                true,
                COMMAND_TIMEOUT,
            )
            .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(error @ device_target::Error::Command {
                timed_out: false, ..
            }) => {
                let online = self.online_devices().await?;

                let unsupported: Vec<DeviceId> = concurrently(online.iter().map(|&device| async move {
                    let supported = self.governors(device).await?;
                    Ok::<_, Error>(
                        (!supported.iter().any(|candidate| candidate == governor))
                            .then_some(device),
                    )
                }))
                .await?
                .into_iter()
                .flatten()
                .collect();

                if unsupported.is_empty() {
                    Err(error.into())
                } else {
                    Err(Error::UnsupportedGovernorForDevices {
                        governor: governor.to_string(),
                        devices: unsupported,
                    })
                }
            }
            Err(error) => Err(error.into()),
        }
    }

    /// The current frequency of every device, read in one shell round trip.
    pub async fn all_frequencies(&self) -> Result<BTreeMap<DeviceId, u64>> {
        let output = self
            .target()
            .run_command("cpufreq_get_all_frequencies", true, COMMAND_TIMEOUT)
            .await?;

        Ok(parse_per_device_listing(&output)
            .into_iter()
            .filter_map(|(device, value)| Some((device, value.parse().ok()?)))
            .collect())
    }

    /// Pins every device to `frequency` in one shell round trip.
    ///
    /// Every device must already run the manual governor; the utility writes blindly.
    pub async fn set_all_frequencies(&self, frequency: u64) -> Result<()> {
        self.target()
            .run_command(
                &format!("cpufreq_set_all_frequencies {frequency}"),
                true,
                COMMAND_TIMEOUT,
            )
            .await?;

        Ok(())
    }
}

/// Parses `cpuN value` lines as the bulk shell utilities emit them. Malformed lines are
/// skipped; the utilities interleave diagnostics with their output on some devices.
fn parse_per_device_listing(output: &str) -> BTreeMap<DeviceId, String> {
    let mut listing = BTreeMap::new();

    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(device), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Some(id) = device
            .strip_prefix("cpu")
            .and_then(|id| id.parse().ok())
        else {
            continue;
        };

        listing.insert(id, value.to_string());
    }

    listing
}

fn parse_frequencies(path: &str, content: &str) -> Result<Vec<u64>> {
    content
        .split_whitespace()
        .map(|entry| parse_frequency(path, entry))
        .collect()
}

fn parse_frequency(path: &str, entry: &str) -> Result<u64> {
    entry.parse().map_err(|_| {
        Error::Device(device_target::Error::Parse {
            path: path.to_string(),
            expected: "a frequency in kHz",
            content: entry.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use device_target::fake::FakeTarget;
    use interleave::run_blocking;

    use super::*;

    fn manual_device() -> FakeTarget {
        FakeTarget::new()
            .with_online([0])
            .with_file(
                "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor",
                "userspace",
            )
            .with_command(
                "cat /sys/devices/system/cpu/cpu0/cpufreq/scaling_available_frequencies",
                "1800000 600000 1200000",
            )
            .with_sticky_file(
                "/sys/devices/system/cpu/cpu0/cpufreq/scaling_setspeed",
                "<setspeed>",
            )
            .with_file("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_cur_freq", "1200000")
    }

    #[test]
    fn available_frequencies_are_sorted_and_cached() {
        let cpufreq = Cpufreq::new(manual_device());

        let first = run_blocking(cpufreq.frequencies(0)).unwrap();
        let second = run_blocking(cpufreq.frequencies(0)).unwrap();

        assert_eq!(first, vec![600_000, 1_200_000, 1_800_000]);
        assert_eq!(second, first);
        assert_eq!(run_blocking(cpufreq.max_available_frequency(0)).unwrap(), Some(1_800_000));
        assert_eq!(run_blocking(cpufreq.min_available_frequency(0)).unwrap(), Some(600_000));
    }

    #[test]
    fn frequencies_fall_back_to_time_in_state() {
        let target = FakeTarget::new().with_file(
            "/sys/devices/system/cpu/cpu0/cpufreq/stats/time_in_state",
            "600000 3817\n1200000 92\n",
        );
        let cpufreq = Cpufreq::new(target);

        let frequencies = run_blocking(cpufreq.frequencies(0)).unwrap();

        assert_eq!(frequencies, vec![600_000, 1_200_000]);
    }

    #[test]
    fn unenumerable_frequencies_are_an_empty_list() {
        let cpufreq = Cpufreq::new(FakeTarget::new());

        let frequencies = run_blocking(cpufreq.frequencies(0)).unwrap();

        assert!(frequencies.is_empty());
    }

    #[test]
    fn set_frequency_requires_the_manual_governor() {
        let target = manual_device().with_file(
            "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor",
            "ondemand",
        );
        let cpufreq = Cpufreq::new(target);

        let error = run_blocking(cpufreq.set_frequency(0, 1_200_000, false)).unwrap_err();

        assert!(matches!(
            error,
            Error::GovernorRequired {
                required: "userspace",
                ..
            }
        ));
        assert!(cpufreq.target().writes().is_empty());
    }

    #[test]
    fn exact_set_frequency_refuses_unlisted_values() {
        let cpufreq = Cpufreq::new(manual_device());

        let error = run_blocking(cpufreq.set_frequency(0, 900_000, true)).unwrap_err();

        assert!(matches!(error, Error::UnsupportedFrequency { .. }));
    }

    #[test]
    fn inexact_set_frequency_writes_any_value() {
        let cpufreq = Cpufreq::new(manual_device());

        run_blocking(cpufreq.set_frequency(0, 900_000, false)).unwrap();

        assert_eq!(
            cpufreq
                .target()
                .writes_to("/sys/devices/system/cpu/cpu0/cpufreq/scaling_setspeed"),
            vec!["900000"]
        );
    }

    #[test]
    fn frequency_limits_round_trip() {
        let target = manual_device()
            .with_file("/sys/devices/system/cpu/cpu0/cpufreq/scaling_min_freq", "600000")
            .with_file("/sys/devices/system/cpu/cpu0/cpufreq/scaling_max_freq", "1800000");
        let cpufreq = Cpufreq::new(target);

        assert_eq!(run_blocking(cpufreq.min_frequency(0)).unwrap(), 600_000);
        assert_eq!(run_blocking(cpufreq.max_frequency(0)).unwrap(), 1_800_000);

        run_blocking(cpufreq.set_max_frequency(0, 1_200_000, true)).unwrap();

        assert_eq!(run_blocking(cpufreq.max_frequency(0)).unwrap(), 1_200_000);
    }

    #[test]
    fn bulk_listings_parse_per_device_lines() {
        let target = FakeTarget::new()
            .with_command("cpufreq_get_all_governors", "cpu0 ondemand\ncpu1 performance\n")
            .with_command("cpufreq_get_all_frequencies", "cpu0 600000\ncpu1 noise\n");
        let cpufreq = Cpufreq::new(target);

        let governors = run_blocking(cpufreq.all_governors()).unwrap();
        let frequencies = run_blocking(cpufreq.all_frequencies()).unwrap();

        assert_eq!(
            governors,
            BTreeMap::from([(0, "ondemand".to_string()), (1, "performance".to_string())])
        );
        assert_eq!(frequencies, BTreeMap::from([(0, 600_000)]));
    }

    #[test]
    fn bulk_governor_switch_reports_unsupported_devices() {
        let target = FakeTarget::new()
            .with_online([0, 1])
            .with_failing_command("cpufreq_set_all_governors interactive", "write failed")
            .with_file(
                "/sys/devices/system/cpu/cpu0/cpufreq/scaling_available_governors",
                "ondemand interactive",
            )
            .with_file(
                "/sys/devices/system/cpu/cpu1/cpufreq/scaling_available_governors",
                "ondemand",
            );
        let cpufreq = Cpufreq::new(target);

        let error = run_blocking(cpufreq.set_all_governors("interactive")).unwrap_err();

        assert!(matches!(
            error,
            Error::UnsupportedGovernorForDevices { ref devices, .. } if *devices == vec![1]
        ));
    }

    #[test]
    fn bulk_governor_switch_propagates_unexplained_failures() {
        let target = FakeTarget::new()
            .with_online([0])
            .with_failing_command("cpufreq_set_all_governors ondemand", "device wedged")
            .with_file(
                "/sys/devices/system/cpu/cpu0/cpufreq/scaling_available_governors",
                "ondemand",
            );
        let cpufreq = Cpufreq::new(target);

        let error = run_blocking(cpufreq.set_all_governors("ondemand")).unwrap_err();

        assert!(matches!(
            error,
            Error::Device(device_target::Error::Command { .. })
        ));
    }
}
