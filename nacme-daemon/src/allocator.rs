//! IP address and hostname allocation.
//!
//! Allocation is optimistic: a candidate is only checked against the ledger
//! at the time it is picked. Two requests can still pick the same candidate;
//! the loser learns about it from the unique constraint at commit time and
//! asks for a new allocation.

use std::collections::HashSet;
use std::net::IpAddr;

use async_trait::async_trait;
use nacme_core::{random_suffix, AddressPool, HostnamePrefix, PoolError};
use rand::rngs::OsRng;
use rand::Rng;

use crate::ledger::LedgerError;

/// Pools with fewer usable addresses than this are scanned exhaustively.
pub const SCAN_THRESHOLD: u128 = 100_000;

/// Random probes made against a large pool before giving up.
pub const RANDOM_PROBES: usize = 100;

/// Hostname candidates tried before giving up.
pub const HOSTNAME_ATTEMPTS: usize = 20;

/// Read access to which addresses and hostnames are already taken.
#[async_trait]
pub trait Occupancy: Send + Sync {
    /// Every address currently assigned to a host.
    async fn occupied_ips(&self) -> Result<HashSet<IpAddr>, LedgerError>;

    async fn ip_in_use(&self, ip: IpAddr) -> Result<bool, LedgerError>;

    async fn hostname_in_use(&self, hostname: &str) -> Result<bool, LedgerError>;
}

/// Occupancy that also treats a set of discarded values as taken.
pub struct Excluding<'a, O: ?Sized> {
    inner: &'a O,
    ips: &'a HashSet<IpAddr>,
    hostnames: &'a HashSet<String>,
}

impl<'a, O: ?Sized> Excluding<'a, O> {
    pub fn new(inner: &'a O, ips: &'a HashSet<IpAddr>, hostnames: &'a HashSet<String>) -> Self {
        Self {
            inner,
            ips,
            hostnames,
        }
    }
}

#[async_trait]
impl<'a, O> Occupancy for Excluding<'a, O>
where
    O: Occupancy + ?Sized,
{
    async fn occupied_ips(&self) -> Result<HashSet<IpAddr>, LedgerError> {
        let mut occupied = self.inner.occupied_ips().await?;
        occupied.extend(self.ips.iter().copied());
        Ok(occupied)
    }

    async fn ip_in_use(&self, ip: IpAddr) -> Result<bool, LedgerError> {
        if self.ips.contains(&ip) {
            return Ok(true);
        }
        self.inner.ip_in_use(ip).await
    }

    async fn hostname_in_use(&self, hostname: &str) -> Result<bool, LedgerError> {
        if self.hostnames.contains(hostname) {
            return Ok(true);
        }
        self.inner.hostname_in_use(hostname).await
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AllocationError {
    /// Every usable address in a small pool is assigned.
    #[error("no available IPs in subnet {0}")]
    PoolExhausted(AddressPool),

    /// Random probing of a large pool found nothing free.
    #[error("could not find an available IP in subnet {pool} after {attempts} attempts")]
    ProbesExhausted { pool: AddressPool, attempts: usize },

    #[error("could not generate a unique hostname after {0} attempts")]
    HostnameExhausted(usize),

    /// The pool itself cannot hold any host.
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Storage(#[from] LedgerError),
}

/// Pick an address for a new host.
///
/// A `suggested` address is returned as long as it is free. It must already
/// have passed [`AddressPool::validate_assignable`].
pub async fn allocate_ip<O>(
    pool: &AddressPool,
    occupancy: &O,
    suggested: Option<IpAddr>,
) -> Result<IpAddr, AllocationError>
where
    O: Occupancy + ?Sized,
{
    let usable = pool.ensure_usable()?;

    if let Some(ip) = suggested {
        if !occupancy.ip_in_use(ip).await? {
            return Ok(ip);
        }
        tracing::debug!(ip = %ip, "Suggested IP taken, falling back to automatic allocation");
    }

    if usable < SCAN_THRESHOLD {
        scan_pool(pool, usable, occupancy).await
    } else {
        probe_pool(pool, usable, occupancy).await
    }
}

/// Walk every usable offset once, starting at a random one.
async fn scan_pool<O>(
    pool: &AddressPool,
    usable: u128,
    occupancy: &O,
) -> Result<IpAddr, AllocationError>
where
    O: Occupancy + ?Sized,
{
    let occupied = occupancy.occupied_ips().await?;
    let start = OsRng.gen_range(0..usable);

    (0..usable)
        .map(|step| pool.address_at(1 + (start + step) % usable))
        .find(|candidate| !occupied.contains(candidate))
        .ok_or(AllocationError::PoolExhausted(*pool))
}

async fn probe_pool<O>(
    pool: &AddressPool,
    usable: u128,
    occupancy: &O,
) -> Result<IpAddr, AllocationError>
where
    O: Occupancy + ?Sized,
{
    for _ in 0..RANDOM_PROBES {
        let candidate = pool.address_at(OsRng.gen_range(1..=usable));
        if !occupancy.ip_in_use(candidate).await? {
            return Ok(candidate);
        }
    }
    Err(AllocationError::ProbesExhausted {
        pool: *pool,
        attempts: RANDOM_PROBES,
    })
}

/// Pick an unused `<prefix>-<suffix>` hostname.
pub async fn allocate_hostname<O>(
    prefix: &HostnamePrefix,
    suffix_len: usize,
    occupancy: &O,
) -> Result<String, AllocationError>
where
    O: Occupancy + ?Sized,
{
    for _ in 0..HOSTNAME_ATTEMPTS {
        let candidate = prefix.with_suffix(&random_suffix(suffix_len));
        if !occupancy.hostname_in_use(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(AllocationError::HostnameExhausted(HOSTNAME_ATTEMPTS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory occupancy with call counters.
    #[derive(Default)]
    struct FakeOccupancy {
        ips: Mutex<HashSet<IpAddr>>,
        hostnames: Mutex<HashSet<String>>,
        all_hostnames_taken: bool,
        all_ips_taken: bool,
        ip_lookups: AtomicUsize,
        hostname_lookups: AtomicUsize,
    }

    impl FakeOccupancy {
        fn with_ips<I: IntoIterator<Item = &'static str>>(ips: I) -> Self {
            let occupancy = Self::default();
            occupancy
                .ips
                .lock()
                .unwrap()
                .extend(ips.into_iter().map(|s| s.parse::<IpAddr>().unwrap()));
            occupancy
        }
    }

    #[async_trait]
    impl Occupancy for FakeOccupancy {
        async fn occupied_ips(&self) -> Result<HashSet<IpAddr>, LedgerError> {
            Ok(self.ips.lock().unwrap().clone())
        }

        async fn ip_in_use(&self, ip: IpAddr) -> Result<bool, LedgerError> {
            self.ip_lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.all_ips_taken || self.ips.lock().unwrap().contains(&ip))
        }

        async fn hostname_in_use(&self, hostname: &str) -> Result<bool, LedgerError> {
            self.hostname_lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.all_hostnames_taken || self.hostnames.lock().unwrap().contains(hostname))
        }
    }

    fn pool(cidr: &str) -> AddressPool {
        AddressPool::parse(cidr).unwrap()
    }

    #[tokio::test]
    async fn test_free_suggestion_is_honoured() {
        let occupancy = FakeOccupancy::default();
        let suggested: IpAddr = "10.200.0.42".parse().unwrap();

        let ip = allocate_ip(&pool("10.200.0.0/24"), &occupancy, Some(suggested))
            .await
            .unwrap();
        assert_eq!(ip, suggested);
    }

    #[tokio::test]
    async fn test_taken_suggestion_falls_back() {
        let occupancy = FakeOccupancy::with_ips(["10.200.0.42"]);
        let suggested: IpAddr = "10.200.0.42".parse().unwrap();
        let pool = pool("10.200.0.0/24");

        let ip = allocate_ip(&pool, &occupancy, Some(suggested)).await.unwrap();
        assert_ne!(ip, suggested);
        assert!(pool.validate_assignable(ip).is_ok());
    }

    #[tokio::test]
    async fn test_scan_finds_only_free_address() {
        // /29: usable .1 through .6
        let occupancy = FakeOccupancy::with_ips([
            "10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.5", "10.0.0.6",
        ]);

        for _ in 0..10 {
            let ip = allocate_ip(&pool("10.0.0.0/29"), &occupancy, None).await.unwrap();
            assert_eq!(ip, "10.0.0.4".parse::<IpAddr>().unwrap());
        }
    }

    #[tokio::test]
    async fn test_scan_never_returns_network_or_broadcast() {
        let occupancy = FakeOccupancy::default();
        let pool = pool("10.0.0.0/30");

        for _ in 0..50 {
            let ip = allocate_ip(&pool, &occupancy, None).await.unwrap();
            assert!(ip == "10.0.0.1".parse::<IpAddr>().unwrap()
                || ip == "10.0.0.2".parse::<IpAddr>().unwrap());
        }
    }

    #[tokio::test]
    async fn test_full_small_pool() {
        let occupancy = FakeOccupancy::with_ips(["10.0.0.1", "10.0.0.2"]);
        let err = allocate_ip(&pool("10.0.0.0/30"), &occupancy, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_pool_without_usable_addresses() {
        let occupancy = FakeOccupancy::default();
        let err = allocate_ip(&pool("10.0.0.0/31"), &occupancy, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AllocationError::Pool(PoolError::NoUsableAddresses(_))
        ));
    }

    #[tokio::test]
    async fn test_large_pool_uses_random_probes() {
        let occupancy = FakeOccupancy::default();
        let pool = pool("10.0.0.0/8");

        let ip = allocate_ip(&pool, &occupancy, None).await.unwrap();
        assert!(pool.validate_assignable(ip).is_ok());
        assert_eq!(occupancy.ip_lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_large_pool_gives_up_after_probe_budget() {
        let occupancy = FakeOccupancy {
            all_ips_taken: true,
            ..Default::default()
        };

        let err = allocate_ip(&pool("10.0.0.0/8"), &occupancy, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AllocationError::ProbesExhausted { attempts: RANDOM_PROBES, .. }
        ));
        assert_eq!(occupancy.ip_lookups.load(Ordering::SeqCst), RANDOM_PROBES);
    }

    #[tokio::test]
    async fn test_ipv6_pool() {
        let occupancy = FakeOccupancy::default();
        let pool = pool("fd00:abcd::/64");

        let ip = allocate_ip(&pool, &occupancy, None).await.unwrap();
        assert!(pool.contains(&ip));
        assert_ne!(ip, pool.network());
    }

    #[tokio::test]
    async fn test_excluded_suggestion_falls_back() {
        let occupancy = FakeOccupancy::default();
        let suggested: IpAddr = "10.200.0.77".parse().unwrap();
        let ips = HashSet::from([suggested]);
        let hostnames = HashSet::new();
        let excluding = Excluding::new(&occupancy, &ips, &hostnames);

        let ip = allocate_ip(&pool("10.200.0.0/24"), &excluding, Some(suggested))
            .await
            .unwrap();
        assert_ne!(ip, suggested);
    }

    #[tokio::test]
    async fn test_scan_skips_excluded_addresses() {
        // /29: usable .1 through .6; .4 was discarded, .6 is the only one left
        let occupancy =
            FakeOccupancy::with_ips(["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.5"]);
        let ips = HashSet::from(["10.0.0.4".parse::<IpAddr>().unwrap()]);
        let hostnames = HashSet::new();
        let excluding = Excluding::new(&occupancy, &ips, &hostnames);

        for _ in 0..10 {
            let ip = allocate_ip(&pool("10.0.0.0/29"), &excluding, None).await.unwrap();
            assert_eq!(ip, "10.0.0.6".parse::<IpAddr>().unwrap());
        }

        let ips = HashSet::from([
            "10.0.0.4".parse::<IpAddr>().unwrap(),
            "10.0.0.6".parse::<IpAddr>().unwrap(),
        ]);
        let excluding = Excluding::new(&occupancy, &ips, &hostnames);
        let err = allocate_ip(&pool("10.0.0.0/29"), &excluding, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_excluded_hostname_counts_as_taken() {
        let occupancy = FakeOccupancy::default();
        let ips = HashSet::new();
        let hostnames = HashSet::from(["web-ab".to_string()]);
        let excluding = Excluding::new(&occupancy, &ips, &hostnames);

        assert!(excluding.hostname_in_use("web-ab").await.unwrap());
        assert!(!excluding.hostname_in_use("web-cd").await.unwrap());
        assert_eq!(occupancy.hostname_lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hostname_shape() {
        let occupancy = FakeOccupancy::default();
        let prefix = HostnamePrefix::sanitize("web").unwrap();

        let hostname = allocate_hostname(&prefix, 6, &occupancy).await.unwrap();
        let suffix = hostname.strip_prefix("web-").unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_hostname_gives_up_after_attempt_budget() {
        let occupancy = FakeOccupancy {
            all_hostnames_taken: true,
            ..Default::default()
        };

        let err = allocate_hostname(&HostnamePrefix::default(), 6, &occupancy)
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::HostnameExhausted(HOSTNAME_ATTEMPTS)));
        assert_eq!(
            occupancy.hostname_lookups.load(Ordering::SeqCst),
            HOSTNAME_ATTEMPTS
        );
    }
}
