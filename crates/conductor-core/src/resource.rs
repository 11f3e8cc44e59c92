use serde::{Deserialize, Serialize};
use std::fmt;

/// A quantity of cpu, memory, disk and network.
///
/// Units are integral (millicores, MiB, MiB, Mbit/s) so budget checks are
/// exact: a request equal to the remaining budget fits, one unit more does not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceVector {
    /// CPU in millicores.
    #[serde(default)]
    pub cpu: u64,
    /// Memory in MiB.
    #[serde(default)]
    pub memory: u64,
    /// Disk in MiB.
    #[serde(default)]
    pub disk: u64,
    /// Network bandwidth in Mbit/s.
    #[serde(default)]
    pub network: u64,
}

impl ResourceVector {
    /// Creates a vector from its four components.
    pub const fn new(cpu: u64, memory: u64, disk: u64, network: u64) -> Self {
        Self {
            cpu,
            memory,
            disk,
            network,
        }
    }

    /// The empty vector.
    pub const fn zero() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// True when every component is zero.
    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    /// True when every component of `self` is `<=` the matching component of `limit`.
    pub fn fits_within(&self, limit: &ResourceVector) -> bool {
        self.cpu <= limit.cpu
            && self.memory <= limit.memory
            && self.disk <= limit.disk
            && self.network <= limit.network
    }

    /// Component-wise addition, `None` on overflow.
    pub fn checked_add(&self, other: &ResourceVector) -> Option<ResourceVector> {
        Some(Self {
            cpu: self.cpu.checked_add(other.cpu)?,
            memory: self.memory.checked_add(other.memory)?,
            disk: self.disk.checked_add(other.disk)?,
            network: self.network.checked_add(other.network)?,
        })
    }

    /// Component-wise addition clamped at `u64::MAX`.
    pub fn saturating_add(&self, other: &ResourceVector) -> ResourceVector {
        Self {
            cpu: self.cpu.saturating_add(other.cpu),
            memory: self.memory.saturating_add(other.memory),
            disk: self.disk.saturating_add(other.disk),
            network: self.network.saturating_add(other.network),
        }
    }

    /// Component-wise subtraction clamped at zero.
    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        Self {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
            disk: self.disk.saturating_sub(other.disk),
            network: self.network.saturating_sub(other.network),
        }
    }

    /// Dominant share of `self` relative to `total`: the largest per-component
    /// ratio, ignoring components where `total` is zero. Returns `0.0` when
    /// `total` is entirely zero.
    pub fn dominant_share(&self, total: &ResourceVector) -> f64 {
        let pairs = [
            (self.cpu, total.cpu),
            (self.memory, total.memory),
            (self.disk, total.disk),
            (self.network, total.network),
        ];
        pairs
            .iter()
            .filter(|(_, t)| *t > 0)
            .map(|(u, t)| *u as f64 / *t as f64)
            .fold(0.0, f64::max)
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}m mem={}MiB disk={}MiB net={}Mbps",
            self.cpu, self.memory, self.disk, self.network
        )
    }
}

impl<'a> std::iter::Sum<&'a ResourceVector> for ResourceVector {
    fn sum<I: Iterator<Item = &'a ResourceVector>>(iter: I) -> Self {
        iter.fold(ResourceVector::zero(), |acc, r| acc.saturating_add(r))
    }
}
