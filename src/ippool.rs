// src/ippool.rs
// Static-IP allocation ledger. One mutable ledger per process, guarded by a
// mutex; allocate/release are linearizable. Pool exhaustion falls back to
// broadcast−1 descending so a VM always gets a reachable, diagnosable
// address.

use chrono::Utc;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::IpPoolConfig;
use crate::errors::{DomeError, DomeResult};
use crate::model::IpAllocation;

struct PoolState {
    net: Ipv4Net,
    start: Ipv4Addr,
    end: Ipv4Addr,
    gateway: Ipv4Addr,
    dns: Vec<IpAddr>,
    allocations: BTreeMap<Ipv4Addr, IpAllocation>,
}

impl PoolState {
    fn is_taken(&self, addr: Ipv4Addr) -> bool {
        self.allocations.contains_key(&addr)
    }

    fn is_reserved(&self, addr: Ipv4Addr) -> bool {
        addr == self.gateway || addr == self.net.network() || addr == self.net.broadcast()
    }
}

pub struct IpPool {
    pools: Mutex<HashMap<String, PoolState>>,
}

impl IpPool {
    pub fn from_config(configs: &[IpPoolConfig]) -> DomeResult<Self> {
        let mut pools = HashMap::new();
        for config in configs {
            let net: Ipv4Net = config
                .cidr
                .parse()
                .map_err(|e| DomeError::validation(format!("ip pool cidr '{}': {e}", config.cidr)))?;
            let start = as_v4(config.range_start)?;
            let end = as_v4(config.range_end)?;
            let gateway = as_v4(config.gateway)?;
            pools.insert(
                config.cidr.clone(),
                PoolState {
                    net,
                    start,
                    end,
                    gateway,
                    dns: config.dns.clone(),
                    allocations: BTreeMap::new(),
                },
            );
        }
        Ok(IpPool { pools: Mutex::new(pools) })
    }

    /// First free address in the configured range; on exhaustion, broadcast−1
    /// descending until a free address is found (flagged as fallback).
    pub async fn allocate(&self, cidr: &str, vm_ref: &str) -> DomeResult<IpAllocation> {
        let mut pools = self.pools.lock().await;
        let pool = pools
            .get_mut(cidr)
            .ok_or_else(|| DomeError::missing(format!("no ip pool configured for cidr {cidr}")))?;

        let mut chosen = None;
        let mut fallback = false;

        let mut addr = pool.start;
        loop {
            if !pool.is_taken(addr) && !pool.is_reserved(addr) {
                chosen = Some(addr);
                break;
            }
            if addr == pool.end {
                break;
            }
            addr = next_addr(addr);
        }

        if chosen.is_none() {
            // Fallback rule: last usable host address, then decrement.
            let mut candidate = prev_addr(pool.net.broadcast());
            while candidate > pool.net.network() {
                if !pool.is_taken(candidate) && !pool.is_reserved(candidate) {
                    chosen = Some(candidate);
                    fallback = true;
                    break;
                }
                candidate = prev_addr(candidate);
            }
        }

        let ip = chosen.ok_or_else(|| {
            DomeError::permanent(format!("cidr {cidr} has no free addresses left, even via fallback"))
        })?;

        let allocation = IpAllocation {
            cidr: cidr.to_string(),
            ip: IpAddr::V4(ip),
            vm_ref: vm_ref.to_string(),
            allocated_at: Utc::now(),
            fallback,
        };
        pool.allocations.insert(ip, allocation.clone());
        if fallback {
            info!(cidr, %ip, vm_ref, "pool exhausted; allocated fallback address");
        } else {
            debug!(cidr, %ip, vm_ref, "allocated address");
        }
        Ok(allocation)
    }

    /// Idempotent: releasing an address that is not held is a no-op.
    pub async fn release(&self, cidr: &str, ip: IpAddr) -> DomeResult<()> {
        let mut pools = self.pools.lock().await;
        let pool = pools
            .get_mut(cidr)
            .ok_or_else(|| DomeError::missing(format!("no ip pool configured for cidr {cidr}")))?;
        if let IpAddr::V4(v4) = ip {
            if pool.allocations.remove(&v4).is_some() {
                debug!(cidr, %ip, "released address");
            }
        }
        Ok(())
    }

    /// Release every address held by a VM, across pools. Used on VM delete.
    pub async fn release_vm(&self, vm_ref: &str) {
        let mut pools = self.pools.lock().await;
        for pool in pools.values_mut() {
            pool.allocations.retain(|_, alloc| alloc.vm_ref != vm_ref);
        }
    }

    pub async fn gateway(&self, cidr: &str) -> DomeResult<Ipv4Addr> {
        let pools = self.pools.lock().await;
        pools
            .get(cidr)
            .map(|p| p.gateway)
            .ok_or_else(|| DomeError::missing(format!("no ip pool configured for cidr {cidr}")))
    }

    pub async fn dns(&self, cidr: &str) -> Vec<IpAddr> {
        let pools = self.pools.lock().await;
        pools.get(cidr).map(|p| p.dns.clone()).unwrap_or_default()
    }

    pub async fn has_pool(&self, cidr: &str) -> bool {
        self.pools.lock().await.contains_key(cidr)
    }

    pub async fn allocations(&self, cidr: &str) -> Vec<IpAllocation> {
        let pools = self.pools.lock().await;
        pools
            .get(cidr)
            .map(|p| p.allocations.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn as_v4(addr: IpAddr) -> DomeResult<Ipv4Addr> {
    match addr {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(DomeError::validation("ip pools are IPv4 only")),
    }
}

fn next_addr(addr: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr).wrapping_add(1))
}

fn prev_addr(addr: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr).wrapping_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config(start: &str, end: &str) -> IpPoolConfig {
        IpPoolConfig {
            cidr: "10.101.0.0/24".to_string(),
            range_start: start.parse().unwrap(),
            range_end: end.parse().unwrap(),
            gateway: "10.101.0.1".parse().unwrap(),
            dns: vec!["10.101.0.1".parse().unwrap()],
        }
    }

    #[tokio::test]
    async fn allocates_first_free_in_range() {
        let pool = IpPool::from_config(&[pool_config("10.101.0.30", "10.101.0.40")]).unwrap();
        let a = pool.allocate("10.101.0.0/24", "vm:web").await.unwrap();
        let b = pool.allocate("10.101.0.0/24", "vm:db").await.unwrap();
        assert_eq!(a.ip.to_string(), "10.101.0.30");
        assert_eq!(b.ip.to_string(), "10.101.0.31");
        assert!(!a.fallback && !b.fallback);
    }

    #[tokio::test]
    async fn never_hands_out_the_same_address_twice() {
        let pool = IpPool::from_config(&[pool_config("10.101.0.30", "10.101.0.33")]).unwrap();
        let mut seen = std::collections::HashSet::new();
        for i in 0..4 {
            let alloc = pool.allocate("10.101.0.0/24", &format!("vm:{i}")).await.unwrap();
            assert!(seen.insert(alloc.ip));
        }
    }

    #[tokio::test]
    async fn exhaustion_falls_back_to_broadcast_minus_one() {
        let pool = IpPool::from_config(&[pool_config("10.101.0.30", "10.101.0.31")]).unwrap();
        pool.allocate("10.101.0.0/24", "vm:1").await.unwrap();
        pool.allocate("10.101.0.0/24", "vm:2").await.unwrap();
        let third = pool.allocate("10.101.0.0/24", "vm:3").await.unwrap();
        assert_eq!(third.ip.to_string(), "10.101.0.254");
        assert!(third.fallback);
        // The fallback keeps descending.
        let fourth = pool.allocate("10.101.0.0/24", "vm:4").await.unwrap();
        assert_eq!(fourth.ip.to_string(), "10.101.0.253");
        assert!(fourth.fallback);
    }

    #[tokio::test]
    async fn release_returns_pool_to_prior_state() {
        let pool = IpPool::from_config(&[pool_config("10.101.0.30", "10.101.0.40")]).unwrap();
        let alloc = pool.allocate("10.101.0.0/24", "vm:web").await.unwrap();
        pool.release("10.101.0.0/24", alloc.ip).await.unwrap();
        let again = pool.allocate("10.101.0.0/24", "vm:web").await.unwrap();
        assert_eq!(again.ip, alloc.ip);
        // Releasing twice is a no-op.
        pool.release("10.101.0.0/24", alloc.ip).await.unwrap();
        pool.release("10.101.0.0/24", alloc.ip).await.unwrap();
    }

    #[tokio::test]
    async fn gateway_is_never_allocated() {
        let pool = IpPool::from_config(&[pool_config("10.101.0.1", "10.101.0.2")]).unwrap();
        let alloc = pool.allocate("10.101.0.0/24", "vm:x").await.unwrap();
        assert_eq!(alloc.ip.to_string(), "10.101.0.2");
    }

    #[tokio::test]
    async fn release_vm_drops_all_holdings() {
        let pool = IpPool::from_config(&[pool_config("10.101.0.30", "10.101.0.40")]).unwrap();
        pool.allocate("10.101.0.0/24", "vm:web").await.unwrap();
        pool.allocate("10.101.0.0/24", "vm:web").await.unwrap();
        pool.release_vm("vm:web").await;
        assert!(pool.allocations("10.101.0.0/24").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_cidr_is_resource_missing() {
        let pool = IpPool::from_config(&[]).unwrap();
        let err = pool.allocate("192.168.0.0/24", "vm:x").await.unwrap_err();
        assert_eq!(err.kind(), "resource_missing");
    }
}
