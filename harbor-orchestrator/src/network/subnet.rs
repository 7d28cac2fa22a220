//! Private subnet allocation.
//!
//! Hands out non-overlapping `/24` blocks from a fixed, ordered list of RFC1918 supernets.
//! Allocations are recorded in an append-only file (one CIDR per line) that is the single
//! source of truth: every freedom check re-reads it in full under the allocator lock. The
//! record is never compacted, so a subnet is never handed out twice, even across restarts.

use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use ipnetwork::Ipv4Network;

use crate::error::SubnetError;

/// Supernets searched by default, in order.
pub const DEFAULT_SUPERNETS: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

/// Size of every allocated block.
pub const SUBNET_PREFIX: u8 = 24;

/// Parses CIDR notation with any host bits cleared, so `10.1.2.3/8` reads as `10.0.0.0/8`.
pub fn parse_network(s: &str) -> Result<Ipv4Network, SubnetError> {
    let parsed: Ipv4Network = s.trim().parse()?;
    Ok(Ipv4Network::new(parsed.network(), parsed.prefix())?)
}

/// Every `/24` block of `supernet` in increasing address order. Empty when the supernet is
/// smaller than one block.
fn blocks(supernet: Ipv4Network) -> impl Iterator<Item = Ipv4Network> {
    let fits = supernet.prefix() <= SUBNET_PREFIX;
    let step = Ipv4Network::new(supernet.network(), SUBNET_PREFIX).map_or(1, |block| block.size());
    supernet
        .iter()
        .step_by(step as usize)
        .take_while(move |_| fits)
        .filter_map(|addr| Ipv4Network::new(addr, SUBNET_PREFIX).ok())
}

/// Allocator of private `/24` networks, safe to share between concurrent deployments.
///
/// Cloning is cheap and every clone shares the same lock and record file.
#[derive(Debug, Clone)]
pub struct SubnetManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    record: PathBuf,
    supernets: Vec<Ipv4Network>,
    lock: Mutex<()>,
}

impl SubnetManager {
    /// Creates an allocator over [`DEFAULT_SUPERNETS`], recording allocations in `record`.
    ///
    /// The record file is created lazily on the first allocation.
    pub fn new(record: impl Into<PathBuf>) -> Self {
        let supernets = DEFAULT_SUPERNETS
            .iter()
            .filter_map(|s| parse_network(s).ok())
            .collect();
        Self::with_supernets(record, supernets)
    }

    pub fn with_supernets(record: impl Into<PathBuf>, supernets: Vec<Ipv4Network>) -> Self {
        Self {
            inner: Arc::new(Inner {
                record: record.into(),
                supernets,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn record_path(&self) -> &Path {
        &self.inner.record
    }

    pub fn supernets(&self) -> &[Ipv4Network] {
        &self.inner.supernets
    }

    /// Returns true when `cidr` does not overlap any recorded allocation.
    pub fn is_free(&self, cidr: &Ipv4Network) -> Result<bool, SubnetError> {
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.is_free_locked(cidr)
    }

    /// Durably records `cidr` as allocated.
    ///
    /// Freedom is re-checked under the same lock as the append, so of two racing callers
    /// exactly one succeeds and the other gets [`SubnetError::AlreadyAllocated`].
    pub fn allocate(&self, cidr: Ipv4Network) -> Result<(), SubnetError> {
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);

        if !self.is_free_locked(&cidr)? {
            return Err(SubnetError::AlreadyAllocated(cidr));
        }

        if let Some(parent) = self.inner.record.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.record)?;
        writeln!(file, "{}", cidr)?;
        file.sync_all()?;

        debug!("Subnet: recorded {}", cidr);
        Ok(())
    }

    /// Allocates the first free `/24` found in any supernet.
    ///
    /// One blocking worker per supernet walks its blocks in increasing address order and
    /// offers free candidates; the first candidate that survives [`allocate`](Self::allocate)
    /// wins. Candidates lost to a concurrent caller are skipped. Fails with
    /// [`SubnetError::NoAvailableSubnet`] only once every worker has run dry.
    pub async fn next(&self) -> Result<Ipv4Network, SubnetError> {
        let (tx, mut rx) = mpsc::channel(self.inner.supernets.len().max(1));

        for supernet in self.inner.supernets.iter().copied() {
            let manager = self.clone();
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || manager.scan(supernet, tx));
        }
        drop(tx);

        while let Some(candidate) = rx.recv().await {
            let cidr = candidate?;
            let manager = self.clone();
            let outcome = tokio::task::spawn_blocking(move || manager.allocate(cidr))
                .await
                .map_err(|e| SubnetError::Worker(e.to_string()))?;

            match outcome {
                Ok(()) => {
                    info!("Subnet: allocated {}", cidr);
                    return Ok(cidr);
                }
                Err(SubnetError::AlreadyAllocated(_)) => {
                    debug!("Subnet: {} taken by a concurrent caller, trying next", cidr);
                }
                Err(e) => return Err(e),
            }
        }

        Err(SubnetError::NoAvailableSubnet)
    }

    /// All recorded allocations, in record order.
    pub fn allocated(&self) -> Result<Vec<Ipv4Network>, SubnetError> {
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_record()
    }

    fn scan(&self, supernet: Ipv4Network, tx: mpsc::Sender<Result<Ipv4Network, SubnetError>>) {
        for candidate in blocks(supernet) {
            match self.is_free(&candidate) {
                Ok(true) => {
                    // The receiver is gone once the caller has its subnet.
                    if tx.blocking_send(Ok(candidate)).is_err() {
                        return;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            }
        }
        debug!("Subnet: supernet {} exhausted", supernet);
    }

    fn is_free_locked(&self, cidr: &Ipv4Network) -> Result<bool, SubnetError> {
        let taken = self.read_record()?;
        Ok(!taken.iter().any(|t| t.overlaps(*cidr)))
    }

    fn read_record(&self) -> Result<Vec<Ipv4Network>, SubnetError> {
        let file = match File::open(&self.inner.record) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut taken = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_network(line) {
                Ok(cidr) => taken.push(cidr),
                // A torn final line after a crash must not wedge the allocator.
                Err(_) => warn!("Subnet: ignoring malformed record line '{}'", line),
            }
        }
        Ok(taken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use tokio::task::JoinSet;

    #[test]
    fn test_parse_clears_host_bits() {
        let cidr = parse_network(" 172.16.5.9/12 ").unwrap();
        assert_eq!(cidr.to_string(), "172.16.0.0/12");
        assert!(cidr.contains(Ipv4Addr::new(172, 31, 255, 1)));
        assert!(!cidr.contains(Ipv4Addr::new(172, 32, 0, 1)));

        assert!(matches!(
            parse_network("10.0.0.0/33"),
            Err(SubnetError::InvalidCidr(_))
        ));
        assert!(parse_network("not-a-network").is_err());
    }

    #[test]
    fn test_blocks_walk_in_address_order() {
        let walked: Vec<String> = blocks(parse_network("192.168.0.0/22").unwrap())
            .map(|block| block.to_string())
            .collect();
        assert_eq!(
            walked,
            vec![
                "192.168.0.0/24",
                "192.168.1.0/24",
                "192.168.2.0/24",
                "192.168.3.0/24"
            ]
        );
        assert_eq!(blocks(parse_network("10.0.0.0/16").unwrap()).count(), 256);
        assert_eq!(blocks(parse_network("10.0.0.0/28").unwrap()).count(), 0);
    }

    fn manager_over(dir: &tempfile::TempDir, supernets: &[&str]) -> SubnetManager {
        SubnetManager::with_supernets(
            dir.path().join("subnets"),
            supernets.iter().map(|s| parse_network(s).unwrap()).collect(),
        )
    }

    #[test]
    fn test_allocate_marks_subnet_taken() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_over(&dir, &["10.0.0.0/8"]);
        let cidr = parse_network("10.0.7.0/24").unwrap();

        assert!(manager.is_free(&cidr).unwrap());
        manager.allocate(cidr).unwrap();
        assert!(!manager.is_free(&cidr).unwrap());

        match manager.allocate(cidr) {
            Err(SubnetError::AlreadyAllocated(c)) => assert_eq!(c, cidr),
            other => panic!("expected AlreadyAllocated, got {:?}", other),
        }
    }

    #[test]
    fn test_overlapping_blocks_are_not_free() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_over(&dir, &["10.0.0.0/8"]);
        manager.allocate(parse_network("10.1.0.0/16").unwrap()).unwrap();

        assert!(!manager.is_free(&parse_network("10.1.200.0/24").unwrap()).unwrap());
        assert!(manager.is_free(&parse_network("10.2.0.0/24").unwrap()).unwrap());
    }

    #[tokio::test]
    async fn test_next_walks_supernet_in_order_without_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_over(&dir, &["192.168.0.0/16"]);
        manager.allocate(parse_network("192.168.0.0/24").unwrap()).unwrap();

        let first = manager.next().await.unwrap();
        let second = manager.next().await.unwrap();

        assert_eq!(first.to_string(), "192.168.1.0/24");
        assert_eq!(second.to_string(), "192.168.2.0/24");
        assert_eq!(manager.allocated().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_record_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = manager_over(&dir, &["172.16.0.0/12"]).next().await.unwrap();

        let reopened = manager_over(&dir, &["172.16.0.0/12"]);
        assert!(!reopened.is_free(&first).unwrap());
        assert_ne!(reopened.next().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_no_available_subnet() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_over(&dir, &["10.0.0.0/24"]);

        manager.next().await.unwrap();
        assert!(matches!(
            manager.next().await,
            Err(SubnetError::NoAvailableSubnet)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_scarce_space() {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir().unwrap();
        // Three /24s in total across two supernets.
        let manager = manager_over(&dir, &["10.0.0.0/23", "192.168.0.0/24"]);

        let mut callers = JoinSet::new();
        for _ in 0..8 {
            let manager = manager.clone();
            callers.spawn(async move { manager.next().await });
        }

        let mut won = HashSet::new();
        let mut exhausted = 0;
        while let Some(result) = callers.join_next().await {
            match result.unwrap() {
                Ok(cidr) => assert!(won.insert(cidr), "{} handed out twice", cidr),
                Err(SubnetError::NoAvailableSubnet) => exhausted += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(won.len(), 3);
        assert_eq!(exhausted, 5);
    }
}
