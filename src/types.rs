//! Data structures shared by the control loop and its components.
//!
//! Hosts are the static hypervisor inventory.  Guest addresses are
//! learned fresh every iteration by asking each host, and the set of
//! [`Availability`] members is whatever answered a health probe during
//! that same iteration.  Nothing here is persisted across iterations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// A hypervisor machine able to run one proxy guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Host(pub Ipv4Addr);

impl Host {
    pub fn addr(&self) -> IpAddr {
        IpAddr::V4(self.0)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Current guest address per host.  Hosts without a known guest address
/// are simply absent.
pub type GuestMap = BTreeMap<Host, IpAddr>;

/// Result of a single health probe.
///
/// Probe errors are data, not failures: an unreachable guest is an
/// ordinary, expected outcome and is only collapsed into "not in the
/// available set" at the policy boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Available,
    Unreachable(String),
}

/// Guests that answered a health probe this iteration, ordered by
/// address so anything rendered from it is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability(BTreeSet<IpAddr>);

impl Availability {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.0.iter()
    }

    /// Any single member.  Currently the highest address; callers must
    /// not rely on which one.
    pub fn pick_one(&self) -> Option<IpAddr> {
        self.0.last().copied()
    }
}

impl FromIterator<IpAddr> for Availability {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        write!(f, "[")?;
        for ip in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", ip)?;
            first = false;
        }
        write!(f, "]")
    }
}
