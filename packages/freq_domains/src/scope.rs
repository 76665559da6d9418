use std::collections::{BTreeMap, BTreeSet};

use device_target::{DeviceId, Target};
use foldhash::HashMap;
use futures::try_join;
use interleave::{concurrently, map_concurrently};

use crate::policies::MANUAL_FREQUENCY_GOVERNOR;
use crate::{Cpufreq, Error, Result};

/// Everything needed to put one device's policy back the way it was.
#[derive(Clone, Debug)]
struct Snapshot {
    /// Online devices sharing this device's policy at capture time.
    domain: Vec<DeviceId>,

    governor: String,

    /// Readable tunable values of the governor that was active.
    tunables: BTreeMap<String, String>,

    /// Scaling-layer frequency at capture time. Only meaningful to restore when the
    /// captured governor was the manual one; captured unconditionally because it rides
    /// along in the same concurrent round trip.
    frequency: u64,
}

impl<T> Cpufreq<T>
where
    T: Target + 'static,
{
    /// Runs `body` with `governor` (and `tunables`) active on the given devices, then puts
    /// the previous configuration back.
    ///
    /// `devices` of `None` or an empty set means every online device. The full previous
    /// state (governor, tunables and, under the manual governor, the pinned frequency) is
    /// captured up front; a capture failure aborts before anything is written. The governor
    /// switch is applied once per frequency domain. Restore runs no matter how the body
    /// ends.
    ///
    /// When both the body and the restore fail, the body's error is returned and the
    /// restore failure is attached to it as [`Error::SuppressedRestore`].
    pub async fn with_governor<R, B>(
        &self,
        devices: Option<&BTreeSet<DeviceId>>,
        governor: &str,
        tunables: &BTreeMap<String, String>,
        body: B,
    ) -> Result<R>
    where
        B: AsyncFnOnce() -> Result<R>,
    {
        let devices = match devices {
            Some(devices) if !devices.is_empty() => devices.clone(),
            _ => self.online_devices().await?,
        };

        let snapshots =
            map_concurrently(|device| self.capture(device), devices.iter().copied()).await?;

        // One member per domain carries the domain-global writes; the rest would be
        // redundant repeats through sibling paths.
        let representatives = representatives(&snapshots);

        let applied = concurrently(
            representatives
                .iter()
                .map(|&device| self.set_governor(device, governor, tunables)),
        )
        .await;

        // The body only runs when every domain switched, but restore runs regardless:
        // a partial switch still needs unwinding.
        let primary = match applied {
            Ok(_) => body().await,
            Err(error) => Err(error),
        };

        let restored = self.restore(&snapshots, &representatives).await;

        match (primary, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(restore_error)) => Err(restore_error),
            (Err(primary), Ok(())) => Err(primary),
            (Err(primary), Err(suppressed)) => {
                tracing::warn!(
                    error = %suppressed,
                    "restore failed while handling an earlier failure"
                );

                Err(Error::SuppressedRestore {
                    primary: Box::new(primary),
                    suppressed: Box::new(suppressed),
                })
            }
        }
    }

    async fn capture(&self, device: DeviceId) -> Result<Snapshot> {
        let (domain, governor, tunables, frequency) = try_join!(
            self.affected_devices(device),
            self.governor(device),
            self.tunables(device),
            self.frequency(device, false),
        )?;

        Ok(Snapshot {
            domain,
            governor,
            tunables,
            frequency,
        })
    }

    async fn restore(
        &self,
        snapshots: &HashMap<DeviceId, Snapshot>,
        representatives: &BTreeSet<DeviceId>,
    ) -> Result<()> {
        let no_tunables = BTreeMap::new();

        // Governors first: tunable paths only exist under the active governor.
        concurrently(representatives.iter().map(|&device| {
            let snapshot = &snapshots[&device];

            self.set_governor(device, &snapshot.governor, &no_tunables)
        }))
        .await?;

        // Per-device tunables target device-scoped paths, one batch per representative.
        let per_device = concurrently(representatives.iter().map(|&device| {
            let snapshot = &snapshots[&device];

            async move {
                self.set_tunables(device, Some(&snapshot.governor), Some(true), &snapshot.tunables)
                    .await?;

                // A pinned frequency is policy state the governor switch wiped out.
                if snapshot.governor == MANUAL_FREQUENCY_GOVERNOR {
                    self.set_frequency(device, snapshot.frequency, false).await?;
                }

                Ok::<_, Error>(())
            }
        }));

        // Domain-global tunables are shared per governor; one write-through device each.
        let mut by_governor: BTreeMap<&str, (DeviceId, &BTreeMap<String, String>)> =
            BTreeMap::new();
        for (&device, snapshot) in snapshots {
            by_governor.insert(&snapshot.governor, (device, &snapshot.tunables));
        }

        let global = concurrently(by_governor.iter().map(|(&governor, &(device, tunables))| {
            self.set_tunables(device, Some(governor), Some(false), tunables)
        }));

        // The two batches touch disjoint paths.
        try_join!(per_device, global)?;

        Ok(())
    }
}

/// Picks the smallest captured device of each frequency domain.
///
/// Domain identity comes from the captured membership rather than a representative's own
/// identifier, so a capture set that skips a domain's first member still gets exactly one
/// representative for it.
fn representatives(snapshots: &HashMap<DeviceId, Snapshot>) -> BTreeSet<DeviceId> {
    let mut chosen: BTreeMap<DeviceId, DeviceId> = BTreeMap::new();

    for (&device, snapshot) in snapshots {
        let key = snapshot.domain.iter().copied().min().unwrap_or(device);

        chosen
            .entry(key)
            .and_modify(|representative| *representative = (*representative).min(device))
            .or_insert(device);
    }

    chosen.into_values().collect()
}
