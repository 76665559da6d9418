use std::collections::BTreeSet;
use std::fmt::{self, Debug, Formatter};
use std::rc::Rc;
use std::time::Duration;

use device_target::{DeviceId, Target};
use futures::stream::TryStreamExt;
use futures::{Stream, join, stream};
use interleave::SingleFlight;

use crate::governors::GovernorTunables;
use crate::{Domain, Error, Result, partition};

/// Timeout applied to individual command executions on the device.
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// The governor under which frequency is set manually. Frequency under this governor is not
/// modeled as a tunable and needs separate capture and restore.
pub(crate) const MANUAL_FREQUENCY_GOVERNOR: &str = "userspace";

/// Builds the path of a per-device cpufreq node.
pub(crate) fn device_path(device: DeviceId, leaf: &str) -> String {
    format!("/sys/devices/system/cpu/cpu{device}/cpufreq/{leaf}")
}

/// Builds the path of a governor tunable, honoring its discovered classification.
///
/// Per-device tunables nest under the device's own cpufreq directory; domain-global tunables
/// (old kernels) live in one shared directory per governor.
pub(crate) fn tunable_path(
    per_device: bool,
    device: DeviceId,
    governor: &str,
    tunable: &str,
) -> String {
    if per_device {
        device_path(device, &format!("{governor}/{tunable}"))
    } else {
        format!("/sys/devices/system/cpu/cpufreq/{governor}/{tunable}")
    }
}

/// Builds the path of a governor's tunable directory for the given classification.
pub(crate) fn tunable_dir(per_device: bool, device: DeviceId, governor: &str) -> String {
    if per_device {
        device_path(device, governor)
    } else {
        format!("/sys/devices/system/cpu/cpufreq/{governor}")
    }
}

/// Frequency-domain-aware control of CPU frequency governors on one target machine.
///
/// All operations go through the machine's [`Target`] primitives; every method is suspendable
/// work, runnable either blocking ([`interleave::run_blocking`]) or as part of a larger
/// coordinated call. Hardware facts that cannot change for the process lifetime (supported
/// governors, governor tunable layouts, available frequencies, domain relations, drivers) are
/// memoized with single-flight semantics, so concurrent cold misses perform one device access.
///
/// # Example
///
/// ```
/// use device_target::fake::FakeTarget;
/// use freq_domains::Cpufreq;
/// use interleave::run_blocking;
///
/// let target = FakeTarget::new()
///     .with_online([0])
///     .with_file(
///         "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor",
///         "ondemand",
///     );
///
/// let cpufreq = Cpufreq::new(target);
///
/// let governor = run_blocking(cpufreq.governor(0)).unwrap();
/// assert_eq!(governor, "ondemand");
/// ```
pub struct Cpufreq<T> {
    target: Rc<T>,

    // Discovered hardware facts, assumed immutable for the process lifetime.
    governors: SingleFlight<DeviceId, Result<Vec<String>>>,
    tunable_sets: SingleFlight<String, Result<GovernorTunables>>,
    frequencies: SingleFlight<DeviceId, Result<Vec<u64>>>,
    related: SingleFlight<DeviceId, Result<Vec<DeviceId>>>,
    drivers: SingleFlight<DeviceId, Result<String>>,
}

impl<T> Cpufreq<T>
where
    T: Target + 'static,
{
    /// Creates a control handle for the given target machine.
    #[must_use]
    pub fn new(target: T) -> Self {
        Self {
            target: Rc::new(target),
            governors: SingleFlight::new(),
            tunable_sets: SingleFlight::new(),
            frequencies: SingleFlight::new(),
            related: SingleFlight::new(),
            drivers: SingleFlight::new(),
        }
    }

    /// The underlying target machine.
    #[must_use]
    pub fn target(&self) -> &T {
        &self.target
    }

    pub(crate) fn target_handle(&self) -> Rc<T> {
        Rc::clone(&self.target)
    }

    pub(crate) fn governors_cache(&self) -> &SingleFlight<DeviceId, Result<Vec<String>>> {
        &self.governors
    }

    pub(crate) fn tunable_sets_cache(&self) -> &SingleFlight<String, Result<GovernorTunables>> {
        &self.tunable_sets
    }

    pub(crate) fn frequencies_cache(&self) -> &SingleFlight<DeviceId, Result<Vec<u64>>> {
        &self.frequencies
    }

    /// Whether the cpufreq interface is present on this machine at all.
    pub async fn probe(&self) -> bool {
        // x86 with the Intel P-State driver, generic single-policy, and per-device layouts.
        let (intel_pstate, single_policy, per_device) = join!(
            self.dir_exists("/sys/devices/system/cpu/intel_pstate"),
            self.dir_exists("/sys/devices/system/cpu/cpufreq/policy0"),
            self.dir_exists("/sys/devices/system/cpu/cpu0/cpufreq"),
        );

        intel_pstate || single_policy || per_device
    }

    async fn dir_exists(&self, path: &str) -> bool {
        self.target.list_dir(path).await.is_ok()
    }

    /// The set of devices currently online.
    pub async fn online_devices(&self) -> Result<BTreeSet<DeviceId>> {
        Ok(self.target.online_devices().await?)
    }

    /// The online devices that share a frequency domain with `device`.
    ///
    /// Not cached: the set changes as devices go on and off line.
    pub async fn affected_devices(&self, device: DeviceId) -> Result<Vec<DeviceId>> {
        let path = device_path(device, "affected_cpus");
        let content = self.target.read_text(&path).await?;

        parse_device_list(&path, &content)
    }

    /// All devices that share a frequency domain with `device`, online or not. Cached.
    pub async fn related_devices(&self, device: DeviceId) -> Result<Vec<DeviceId>> {
        let target = self.target_handle();

        self.related
            .get_or_compute(device, async move || {
                let path = device_path(device, "related_cpus");
                let content = target.read_text(&path).await?;

                parse_device_list(&path, &content)
            })
            .await
    }

    /// The name of the driver behind this device's cpufreq policy. Cached.
    pub async fn driver(&self, device: DeviceId) -> Result<String> {
        let target = self.target_handle();

        self.drivers
            .get_or_compute(device, async move || {
                Ok(target.read_text(&device_path(device, "scaling_driver")).await?)
            })
            .await
    }

    /// Lazily iterates over the frequency domains of the online devices.
    ///
    /// Each domain is discovered with one `related_cpus` read through the cache. The stream
    /// consumes its working set and is not restartable; collect it if you need to iterate
    /// twice. Domain membership is the contract, not domain order.
    pub fn domains(&self) -> impl Stream<Item = Result<Domain>> + '_ {
        stream::once(async move {
            let universe = self.online_devices().await?;

            Ok::<_, Error>(partition(universe, async move |device| {
                Ok::<_, Error>(self.related_devices(device).await?.into_iter().collect())
            }))
        })
        .try_flatten()
    }
}

impl<T> Debug for Cpufreq<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpufreq")
            .field("governors", &self.governors)
            .field("tunable_sets", &self.tunable_sets)
            .field("frequencies", &self.frequencies)
            .finish_non_exhaustive()
    }
}

/// Parses a whitespace-separated device list, as `affected_cpus` and `related_cpus` contain.
fn parse_device_list(path: &str, content: &str) -> Result<Vec<DeviceId>> {
    content
        .split_whitespace()
        .map(|entry| {
            entry.parse().map_err(|_| {
                Error::Device(device_target::Error::Parse {
                    path: path.to_string(),
                    expected: "a device list",
                    content: content.to_string(),
                })
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use device_target::fake::FakeTarget;
    use interleave::run_blocking;

    use super::*;

    #[test]
    fn probe_detects_any_known_layout() {
        let with_per_device = Cpufreq::new(
            FakeTarget::new().with_dir("/sys/devices/system/cpu/cpu0/cpufreq", &["scaling_governor"]),
        );
        let with_nothing = Cpufreq::new(FakeTarget::new());

        assert!(run_blocking(with_per_device.probe()));
        assert!(!run_blocking(with_nothing.probe()));
    }

    #[test]
    fn related_devices_are_cached_after_the_first_read() {
        let path = "/sys/devices/system/cpu/cpu0/cpufreq/related_cpus";
        let cpufreq = Cpufreq::new(FakeTarget::new().with_file(path, "0 1"));

        let first = run_blocking(cpufreq.related_devices(0)).unwrap();
        let second = run_blocking(cpufreq.related_devices(0)).unwrap();

        assert_eq!(first, vec![0, 1]);
        assert_eq!(second, first);
        assert_eq!(cpufreq.target().read_count(path), 1);
    }

    #[test]
    fn malformed_device_list_is_a_parse_error() {
        let cpufreq = Cpufreq::new(
            FakeTarget::new()
                .with_file("/sys/devices/system/cpu/cpu0/cpufreq/affected_cpus", "0 oops"),
        );

        let error = run_blocking(cpufreq.affected_devices(0)).unwrap_err();

        assert!(matches!(
            error,
            Error::Device(device_target::Error::Parse { .. })
        ));
    }

    #[test]
    fn domains_cover_the_online_devices() {
        let cpufreq = Cpufreq::new(
            FakeTarget::new()
                .with_online([0, 1, 2, 3])
                .with_file("/sys/devices/system/cpu/cpu0/cpufreq/related_cpus", "0 1")
                .with_file("/sys/devices/system/cpu/cpu2/cpufreq/related_cpus", "2 3"),
        );

        let domains: Vec<Domain> = run_blocking(cpufreq.domains().try_collect()).unwrap();

        assert_eq!(domains.len(), 2);

        let mut seen = BTreeSet::new();
        for domain in &domains {
            seen.extend(domain.members());
        }
        assert_eq!(seen, BTreeSet::from([0, 1, 2, 3]));
    }
}
