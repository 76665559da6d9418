use std::collections::{BTreeMap, BTreeSet};

use device_target::{DeviceId, Target};
use interleave::{concurrently, map_concurrently};

use crate::policies::{device_path, tunable_dir, tunable_path};
use crate::{Cpufreq, Error, Result};

/// Governor tunables that exist but cannot be read back, keyed by governor name.
///
/// These are momentary triggers rather than settings; reading them fails and read views of
/// a governor's tunables must leave them out. Writes to them cannot be verified.
fn write_only_tunables(governor: &str) -> &'static [&'static str] {
    match governor {
        "interactive" => &["boostpulse"],
        _ => &[],
    }
}

/// A governor's tunable layout, as discovered by probing the device.
#[derive(Clone, Debug)]
pub(crate) struct GovernorTunables {
    /// Whether the tunables live under each device's own cpufreq directory. When false,
    /// one shared directory configures the governor across every domain that runs it.
    pub(crate) per_device: bool,

    /// Names of the governor's tunables, write-only ones included.
    pub(crate) names: Vec<String>,
}

impl<T> Cpufreq<T>
where
    T: Target + 'static,
{
    /// The governors this device's policy supports. Cached.
    pub async fn governors(&self, device: DeviceId) -> Result<Vec<String>> {
        let target = self.target_handle();

        self.governors_cache()
            .get_or_compute(device, async move || {
                let path = device_path(device, "scaling_available_governors");
                let content = target.read_text(&path).await?;

                Ok(content.split_whitespace().map(str::to_owned).collect())
            })
            .await
    }

    /// The governor currently active on this device's policy.
    pub async fn governor(&self, device: DeviceId) -> Result<String> {
        Ok(self
            .target()
            .read_text(&device_path(device, "scaling_governor"))
            .await?)
    }

    /// Switches this device's policy to `governor`, then applies `tunables` to it.
    ///
    /// The write takes effect for every device sharing the policy. The governor must be
    /// supported; passing an unsupported name fails before anything is written. Tunables are
    /// applied after the switch because their paths only exist under the active governor.
    pub async fn set_governor(
        &self,
        device: DeviceId,
        governor: &str,
        tunables: &BTreeMap<String, String>,
    ) -> Result<()> {
        let supported = self.governors(device).await?;

        if !supported.iter().any(|candidate| candidate == governor) {
            return Err(Error::UnsupportedGovernor {
                device,
                governor: governor.to_string(),
                supported,
            });
        }

        tracing::debug!(device, governor, "switching governor");

        self.target()
            .write_text(&device_path(device, "scaling_governor"), governor, true)
            .await?;

        self.set_tunables(device, Some(governor), None, tunables).await
    }

    /// Switches every listed device's policy to `governor`, concurrently.
    ///
    /// Listing one member per domain suffices; listing several is harmless because the
    /// governor switch is idempotent.
    pub async fn set_governor_for(
        &self,
        devices: &BTreeSet<DeviceId>,
        governor: &str,
        tunables: &BTreeMap<String, String>,
    ) -> Result<()> {
        concurrently(
            devices
                .iter()
                .map(|&device| self.set_governor(device, governor, tunables)),
        )
        .await?;

        Ok(())
    }

    /// The names of the tunables of this device's active governor, write-only ones included.
    pub async fn tunable_names(&self, device: DeviceId) -> Result<Vec<String>> {
        let (_, set) = self.discover_tunables(device, None).await?;

        Ok(set.names)
    }

    /// The current values of the readable tunables of this device's active governor.
    ///
    /// Values are read concurrently. Write-only tunables are left out.
    pub async fn tunables(&self, device: DeviceId) -> Result<BTreeMap<String, String>> {
        let (governor, set) = self.discover_tunables(device, None).await?;
        let write_only = write_only_tunables(&governor);

        let names: Vec<String> = set
            .names
            .iter()
            .filter(|name| !write_only.contains(&name.as_str()))
            .cloned()
            .collect();

        let values = map_concurrently(
            |name: String| {
                let governor = governor.clone();
                let per_device = set.per_device;

                async move {
                    let primary = tunable_path(per_device, device, &governor, &name);

                    match self.target().read_text(&primary).await {
                        Ok(value) => Ok::<_, Error>(value),
                        Err(error) => {
                            // Some governors scatter tunables across both layouts; try the
                            // other one before giving up.
                            let other = tunable_path(!per_device, device, &governor, &name);

                            match self.target().read_text(&other).await {
                                Ok(value) => Ok(value),
                                Err(_) => Err(error.into()),
                            }
                        }
                    }
                }
            },
            names,
        )
        .await?;

        Ok(values.into_iter().collect())
    }

    /// Writes governor tunables on this device's policy.
    ///
    /// `governor` defaults to the device's active governor. When `per_device_filter` is set,
    /// only tunables of the matching classification are written and the rest are skipped
    /// silently; restore logic uses this to split one snapshot into two disjoint batches.
    ///
    /// Writes are sequential in name order and each name is validated as it is reached, so
    /// an unknown name partway through leaves the earlier writes in place.
    pub async fn set_tunables(
        &self,
        device: DeviceId,
        governor: Option<&str>,
        per_device_filter: Option<bool>,
        values: &BTreeMap<String, String>,
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }

        let (governor, set) = self.discover_tunables(device, governor).await?;
        let write_only = write_only_tunables(&governor);

        for (tunable, value) in values {
            if !set.names.contains(tunable) {
                return Err(Error::UnknownTunable {
                    device,
                    governor,
                    tunable: tunable.clone(),
                    valid: set.names,
                });
            }

            if per_device_filter.is_some_and(|wanted| wanted != set.per_device) {
                continue;
            }

            let path = tunable_path(set.per_device, device, &governor, tunable);
            let verify = !write_only.contains(&tunable.as_str());

            self.target().write_text(&path, value, verify).await?;
        }

        Ok(())
    }

    /// Discovers (or recalls) the tunable layout of a governor, resolving `governor` to the
    /// device's active one when absent.
    pub(crate) async fn discover_tunables(
        &self,
        device: DeviceId,
        governor: Option<&str>,
    ) -> Result<(String, GovernorTunables)> {
        let governor = match governor {
            Some(governor) => governor.to_string(),
            None => self.governor(device).await?,
        };

        let target = self.target_handle();
        let probe_governor = governor.clone();

        let set = self
            .tunable_sets_cache()
            .get_or_compute(governor.clone(), async move || {
                // Newer kernels nest tunables under the policy; older ones share one
                // directory per governor. Governors without tunables have neither.
                match target.list_dir(&tunable_dir(true, device, &probe_governor)).await {
                    Ok(names) => Ok(GovernorTunables {
                        per_device: true,
                        names,
                    }),
                    Err(_) => match target.list_dir(&tunable_dir(false, device, &probe_governor)).await
                    {
                        Ok(names) => Ok(GovernorTunables {
                            per_device: false,
                            names,
                        }),
                        Err(_) => Ok(GovernorTunables {
                            per_device: false,
                            names: Vec::new(),
                        }),
                    },
                }
            })
            .await?;

        Ok((governor, set))
    }
}
