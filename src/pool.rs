//! Allocation pools
//!
//! Pools are stateless: each allocator takes the configured range plus the
//! set of values currently held by live records and hands back the first
//! free value. Release is implicit, a destroyed record simply stops being
//! part of the held set. Atomicity with the consuming write is the store's
//! job (see [`crate::db::Database::reserve_vm`]).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::{Error, Result};

/// IPv4 address pool for primary VM addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Pool {
    /// CIDR of the VM network, e.g. `10.0.0.0/24`
    pub network: String,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    /// Never handed out, even when inside the range
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
}

impl Ipv4Pool {
    pub fn new(network: impl Into<String>, start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self {
            network: network.into(),
            start,
            end,
            gateway: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if u32::from(self.start) > u32::from(self.end) {
            return Err(Error::Config(format!(
                "ip_pool start {} is after end {}",
                self.start, self.end
            )));
        }
        let (net, prefix) = self.parse_network()?;
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        for addr in [self.start, self.end] {
            if u32::from(addr) & mask != u32::from(net) & mask {
                return Err(Error::Config(format!(
                    "ip_pool address {} is outside network {}",
                    addr, self.network
                )));
            }
        }
        if self.size() == 0 {
            return Err(Error::Config("ip_pool has no allocatable addresses".into()));
        }
        Ok(())
    }

    /// Prefix length of the VM network
    pub fn prefix_len(&self) -> Result<u8> {
        Ok(self.parse_network()?.1)
    }

    fn parse_network(&self) -> Result<(Ipv4Addr, u8)> {
        let (addr, prefix) = self
            .network
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("ip_pool network must be CIDR: {}", self.network)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::Config(format!("invalid ip_pool network: {}", self.network)))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| Error::Config(format!("invalid ip_pool prefix: {}", self.network)))?;
        Ok((addr, prefix))
    }

    /// Number of addresses that can be handed out
    pub fn size(&self) -> u64 {
        let span = (u32::from(self.end) as u64).saturating_sub(u32::from(self.start) as u64) + 1;
        match self.gateway {
            Some(gw) if self.contains(gw) => span - 1,
            _ => span,
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        (u32::from(self.start)..=u32::from(self.end)).contains(&u32::from(addr))
    }

    /// First address in the range not held by `used`
    pub fn allocate(&self, used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end))
            .map(Ipv4Addr::from)
            .find(|ip| Some(*ip) != self.gateway && !used.contains(ip))
    }
}

/// Optional IPv6 pool for secondary addresses, routed per-VM as /128
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6Pool {
    /// Routed prefix, e.g. `2001:db8:1::/64`
    pub prefix: String,
    pub start: Ipv6Addr,
    pub end: Ipv6Addr,
}

impl Ipv6Pool {
    pub fn new(prefix: impl Into<String>, start: Ipv6Addr, end: Ipv6Addr) -> Self {
        Self {
            prefix: prefix.into(),
            start,
            end,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if u128::from(self.start) > u128::from(self.end) {
            return Err(Error::Config(format!(
                "ipv6_pool start {} is after end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        (u128::from(self.start)..=u128::from(self.end)).contains(&u128::from(addr))
    }

    pub fn allocate(&self, used: &HashSet<Ipv6Addr>) -> Option<Ipv6Addr> {
        (u128::from(self.start)..=u128::from(self.end))
            .map(Ipv6Addr::from)
            .find(|ip| !used.contains(ip))
    }
}

/// Hypervisor identifier range (Proxmox VMIDs)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmidRange {
    pub start: u32,
    pub end: u32,
}

impl Default for VmidRange {
    fn default() -> Self {
        Self { start: 100, end: 999 }
    }
}

impl VmidRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn validate(&self) -> Result<()> {
        // Proxmox reserves ids below 100
        if self.start < 100 {
            return Err(Error::Config("vmid_range must start at 100 or above".into()));
        }
        if self.start > self.end {
            return Err(Error::Config(format!(
                "vmid_range start {} is after end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn contains(&self, vmid: u32) -> bool {
        (self.start..=self.end).contains(&vmid)
    }

    pub fn allocate(&self, used: &HashSet<u32>) -> Option<u32> {
        (self.start..=self.end).find(|id| !used.contains(id))
    }
}

/// Values picked for one VM, all from the same snapshot of the held set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub ip: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
    pub vmid: u32,
}

/// Values currently held by live records
#[derive(Debug, Clone, Default)]
pub struct HeldSet {
    pub ips: HashSet<Ipv4Addr>,
    pub ipv6s: HashSet<Ipv6Addr>,
    pub vmids: HashSet<u32>,
}

/// Every pool a create draws from
#[derive(Debug, Clone)]
pub struct AllocationPools {
    pub ip: Ipv4Pool,
    pub ipv6: Option<Ipv6Pool>,
    pub vmid: VmidRange,
}

impl AllocationPools {
    pub fn from_config(config: &crate::config::HostConfig) -> Self {
        Self {
            ip: config.ip_pool.clone(),
            ipv6: config.ipv6_pool.clone(),
            vmid: config.vmid_range,
        }
    }

    /// First free value in every pool, or `Conflict` naming the exhausted one
    pub fn allocate(&self, held: &HeldSet) -> Result<Allocation> {
        let ip = self
            .ip
            .allocate(&held.ips)
            .ok_or_else(|| Error::Conflict(format!("address pool {} exhausted", self.ip.network)))?;
        let vmid = self.vmid.allocate(&held.vmids).ok_or_else(|| {
            Error::Conflict(format!(
                "vmid range {}-{} exhausted",
                self.vmid.start, self.vmid.end
            ))
        })?;
        let ipv6 = match &self.ipv6 {
            Some(pool) => Some(pool.allocate(&held.ipv6s).ok_or_else(|| {
                Error::Conflict(format!("ipv6 pool {} exhausted", pool.prefix))
            })?),
            None => None,
        };
        Ok(Allocation { ip, ipv6, vmid })
    }
}

/// Next ownership-token id. Ids are strictly sequential and never reused, so
/// the next one is always one past the highest id ever reserved (burned ids
/// included).
pub fn next_token_id(highest_reserved: Option<u64>, first_id: u64) -> u64 {
    match highest_reserved {
        Some(max) => (max + 1).max(first_id),
        None => first_id,
    }
}
