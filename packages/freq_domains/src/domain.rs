use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::future::Future;

use device_target::DeviceId;
use futures::Stream;
use futures::stream;

/// A set of devices that share one piece of mutable power-management state (one cpufreq
/// policy).
///
/// Writing a domain-global control file through any member affects the whole domain, so a
/// single [representative][Self::representative] member is enough to mutate it. Domains are
/// produced by [`partition`] and form a partition of the device universe they were computed
/// from: pairwise disjoint, union equal to the universe. They are computed freshly per call and
/// never cached across topology changes.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Domain {
    members: BTreeSet<DeviceId>,
}

impl Domain {
    pub(crate) fn new(members: BTreeSet<DeviceId>) -> Self {
        assert!(!members.is_empty(), "a domain always has at least one member");

        Self { members }
    }

    /// The member devices, in ascending order.
    pub fn members(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.members.iter().copied()
    }

    /// The single device chosen to receive domain-global writes on behalf of the whole domain.
    ///
    /// This is the smallest member, matching the convention that the first CPU of a cluster is
    /// the portable one to address.
    #[must_use]
    pub fn representative(&self) -> DeviceId {
        *self
            .members
            .first()
            .expect("a domain always has at least one member")
    }

    /// Whether `device` belongs to this domain.
    #[must_use]
    pub fn contains(&self, device: DeviceId) -> bool {
        self.members.contains(&device)
    }

    /// Number of member devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the domain has no members. Never true for partitioner output.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl FromIterator<DeviceId> for Domain {
    /// Collects devices into a domain.
    ///
    /// # Panics
    ///
    /// Panics if the iterator yields no devices; a domain always has at least one member.
    fn from_iter<I: IntoIterator<Item = DeviceId>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (index, member) in self.members().enumerate() {
            if index > 0 {
                write!(f, ",")?;
            }
            write!(f, "{member}")?;
        }
        write!(f, "}}")
    }
}

/// Lazily partitions `universe` into disjoint domains using the `related_of` relation.
///
/// Each pull takes the smallest remaining device, asks `related_of` for its domain, yields that
/// domain, and removes its members from the remaining set; the stream ends when the set is
/// empty. The working set is consumed, so the stream is finite and not restartable. The seed
/// device is always a member of the yielded domain even if the relation omits it.
///
/// Which remaining device is taken per pull is an iteration-determinism detail only:
/// correctness rests on domain membership, never on yield order.
///
/// # Example
///
/// ```
/// use std::collections::BTreeSet;
///
/// use futures::TryStreamExt;
/// use interleave::run_blocking;
///
/// // Devices 0-3, paired into two domains by integer division.
/// let domains = run_blocking(
///     freq_domains::partition(BTreeSet::from([0, 1, 2, 3]), async |device| {
///         Ok::<_, std::convert::Infallible>(BTreeSet::from([
///             device / 2 * 2,
///             device / 2 * 2 + 1,
///         ]))
///     })
///     .try_collect::<Vec<_>>(),
/// )
/// .unwrap();
///
/// assert_eq!(domains.len(), 2);
/// assert!(domains.iter().any(|domain| domain.contains(0) && domain.contains(1)));
/// ```
pub fn partition<F, Fut, E>(
    universe: BTreeSet<DeviceId>,
    related_of: F,
) -> impl Stream<Item = Result<Domain, E>>
where
    F: FnMut(DeviceId) -> Fut,
    Fut: Future<Output = Result<BTreeSet<DeviceId>, E>>,
{
    stream::try_unfold(
        (universe, related_of),
        async move |(mut remaining, mut related_of)| {
            let Some(&seed) = remaining.first() else {
                return Ok(None);
            };

            let mut members = related_of(seed).await?;
            members.insert(seed);

            for member in &members {
                remaining.remove(member);
            }

            Ok(Some((Domain::new(members), (remaining, related_of))))
        },
    )
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use interleave::run_blocking;

    use super::*;

    /// A big.LITTLE-style relation: 0-3 in one domain, 4-7 in another.
    async fn clustered(device: DeviceId) -> Result<BTreeSet<DeviceId>, &'static str> {
        let base = device / 4 * 4;
        Ok((base..base + 4).collect())
    }

    #[test]
    fn domains_are_disjoint_and_cover_the_universe() {
        let universe: BTreeSet<DeviceId> = (0..8).collect();

        let domains: Vec<Domain> =
            run_blocking(partition(universe.clone(), clustered).try_collect()).unwrap();

        let mut seen = BTreeSet::new();
        for domain in &domains {
            for member in domain.members() {
                // Each device appears in exactly one yielded domain.
                assert!(seen.insert(member), "device {member} appeared twice");
            }
        }

        assert_eq!(seen, universe);
    }

    #[test]
    fn singleton_relation_yields_singleton_domains() {
        let universe: BTreeSet<DeviceId> = BTreeSet::from([0, 3, 5]);

        let domains: Vec<Domain> = run_blocking(
            partition(universe, async |device| {
                Ok::<_, &'static str>(BTreeSet::from([device]))
            })
            .try_collect(),
        )
        .unwrap();

        assert_eq!(domains.len(), 3);
        assert!(domains.iter().all(|domain| domain.len() == 1));
    }

    #[test]
    fn seed_is_always_a_member_even_if_the_relation_omits_it() {
        let domains: Vec<Domain> = run_blocking(
            partition(BTreeSet::from([7]), async |_| {
                Ok::<_, &'static str>(BTreeSet::new())
            })
            .try_collect(),
        )
        .unwrap();

        assert_eq!(domains.len(), 1);
        assert!(domains[0].contains(7));
    }

    #[test]
    fn relation_failure_ends_the_stream_with_the_error() {
        let result: Result<Vec<Domain>, &str> = run_blocking(
            partition(BTreeSet::from([0, 4]), async |device| {
                if device == 4 {
                    Err("related_cpus unreadable")
                } else {
                    clustered(device).await
                }
            })
            .try_collect(),
        );

        assert_eq!(result.unwrap_err(), "related_cpus unreadable");
    }

    #[test]
    fn representative_is_the_smallest_member() {
        let domain: Domain = [5, 2, 9].into_iter().collect();

        assert_eq!(domain.representative(), 2);
        assert_eq!(domain.to_string(), "{2,5,9}");
    }

    #[test]
    #[should_panic(expected = "at least one member")]
    fn collecting_no_devices_is_refused() {
        let _domain: Domain = std::iter::empty().collect();
    }

    #[test]
    fn empty_universe_yields_no_domains() {
        let domains: Vec<Domain> =
            run_blocking(partition(BTreeSet::new(), clustered).try_collect()).unwrap();

        assert!(domains.is_empty());
    }
}
