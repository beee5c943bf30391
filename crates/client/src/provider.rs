//! Cluster config and credentials seams
//!
//! The bootstrap HTTP fetcher lives outside the core; the conductor only
//! consumes a refresh method and a snapshot accessor through
//! [`ConfigProvider`]. Credentials come through [`CredentialsProvider`] so
//! secrets never sit in the config value.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::delay::Delay;
use crate::error::Result;

/// Snapshot of the bucket topology: nodes and the vbucket→master map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    /// Config revision, monotonically increasing on the cluster side
    pub rev: u64,
    /// KV node addresses
    pub nodes: Vec<SocketAddr>,
    /// Per-vbucket index into `nodes`; negative means no master yet
    pub vbucket_map: Vec<i16>,
}

impl BucketConfig {
    pub fn new(rev: u64, nodes: Vec<SocketAddr>, vbucket_map: Vec<i16>) -> Self {
        Self {
            rev,
            nodes,
            vbucket_map,
        }
    }

    pub fn num_partitions(&self) -> u16 {
        self.vbucket_map.len() as u16
    }

    /// Current master node for a partition, if one is assigned
    pub fn master_for(&self, vbid: u16) -> Option<SocketAddr> {
        let index = *self.vbucket_map.get(usize::from(vbid))?;
        if index < 0 {
            return None;
        }
        self.nodes.get(index as usize).copied()
    }

    /// Whether any partition currently has its master on `address`
    pub fn has_primary_partitions_on(&self, address: SocketAddr) -> bool {
        self.vbucket_map
            .iter()
            .any(|&index| index >= 0 && self.nodes.get(index as usize) == Some(&address))
    }

    /// Distinct master addresses covering the given partitions
    pub fn masters_for(&self, vbids: impl IntoIterator<Item = u16>) -> Vec<SocketAddr> {
        let mut masters = Vec::new();
        for vbid in vbids {
            if let Some(address) = self.master_for(vbid)
                && !masters.contains(&address)
            {
                masters.push(address);
            }
        }
        masters
    }
}

/// Source of [`BucketConfig`] snapshots
///
/// `refresh` retries internally within `total_timeout` (zero means a
/// single attempt), pausing `delay.calculate(attempt)` between attempts.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn refresh(
        &self,
        attempt_timeout: Duration,
        total_timeout: Duration,
        delay: Delay,
    ) -> Result<()>;

    /// Latest successfully fetched config
    fn config(&self) -> BucketConfig;
}

/// Source of the credentials used for SASL authentication
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self) -> (String, String);
}

/// Fixed username/password pair
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl CredentialsProvider for StaticCredentials {
    fn credentials(&self) -> (String, String) {
        (self.username.clone(), self.password.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_master_lookup() {
        let config = BucketConfig::new(1, vec![addr(11210), addr(11211)], vec![0, 1, -1]);
        assert_eq!(config.master_for(0), Some(addr(11210)));
        assert_eq!(config.master_for(1), Some(addr(11211)));
        assert_eq!(config.master_for(2), None);
        assert_eq!(config.master_for(9), None);
        assert_eq!(config.num_partitions(), 3);
    }

    #[test]
    fn test_primary_partition_query() {
        let config = BucketConfig::new(1, vec![addr(11210), addr(11211)], vec![0, 0]);
        assert!(config.has_primary_partitions_on(addr(11210)));
        assert!(!config.has_primary_partitions_on(addr(11211)));
    }

    #[test]
    fn test_masters_deduplicated() {
        let config = BucketConfig::new(1, vec![addr(11210), addr(11211)], vec![0, 0, 1]);
        assert_eq!(config.masters_for(0..3), vec![addr(11210), addr(11211)]);
    }
}
