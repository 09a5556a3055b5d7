//! Capacity Controller.
//!
//! Desired capacity is a control signal, not an observation: it is the
//! number of inventory hosts that *should* be running a guest, and it is
//! allowed to drift from what is really running because nothing reports
//! that reliably.  It moves by at most one per iteration:
//!
//! ```text
//! available < min  =>  desired = min(desired + 1, hosts)   start hosts[..desired]
//! available > max  =>  desired = max(desired - 1, 0)       stop one available guest
//! otherwise        =>  unchanged
//! ```
//!
//! The two watermarks plus the single step give the loop its hysteresis.

use std::net::IpAddr;

use crate::types::{Availability, Host};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    None,
    ScaleUp,
    ScaleDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub desired: usize,
    pub action: ScaleAction,
}

/// Apply the watermark policy once.  The branches are exclusive and
/// checked in order: below `min`, above `max`, in range.
pub fn decide(
    available_count: usize,
    desired: usize,
    min: usize,
    max: usize,
    total_hosts: usize,
) -> Decision {
    if available_count < min {
        Decision {
            desired: desired.saturating_add(1).min(total_hosts),
            action: ScaleAction::ScaleUp,
        }
    } else if available_count > max {
        Decision {
            desired: desired.saturating_sub(1),
            action: ScaleAction::ScaleDown,
        }
    } else {
        Decision {
            desired,
            action: ScaleAction::None,
        }
    }
}

/// Concrete work derived from a [`Decision`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalePlan {
    Hold,
    /// Send a start request to this whole inventory prefix.  Hosts that
    /// already run a guest ignore it.
    Start(Vec<Host>),
    /// Shut down exactly this guest.
    Stop(IpAddr),
}

/// Owns desired capacity for the lifetime of the control loop.
#[derive(Debug)]
pub struct CapacityController {
    hosts: Vec<Host>,
    min: usize,
    max: usize,
    desired: usize,
}

impl CapacityController {
    /// Starts believing every host should run a guest.
    pub fn new(hosts: Vec<Host>, min: usize, max: usize) -> Self {
        let desired = hosts.len();
        Self {
            hosts,
            min,
            max,
            desired,
        }
    }

    pub fn desired(&self) -> usize {
        self.desired
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn plan(&mut self, available: &Availability) -> ScalePlan {
        let decision = decide(
            available.len(),
            self.desired,
            self.min,
            self.max,
            self.hosts.len(),
        );
        self.desired = decision.desired;

        match decision.action {
            ScaleAction::None => ScalePlan::Hold,
            ScaleAction::ScaleUp => ScalePlan::Start(self.hosts[..self.desired].to_vec()),
            // available > max >= 0, so there is always a member to pick.
            ScaleAction::ScaleDown => match available.pick_one() {
                Some(ip) => ScalePlan::Stop(ip),
                None => ScalePlan::Hold,
            },
        }
    }
}
