use crate::error::{Result, RuntimeError};
use std::collections::BTreeSet;
use std::fmt;

/// Host ports handed out to workspace agents.
pub const AGENT_PORT_RANGE: PortRange = PortRange {
    start: 50000,
    end: 60000,
};

/// Half-open range of host ports, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..self.end).contains(&port)
    }

    /// Picks the lowest port of the range missing from `used` and marks it used,
    /// so repeated calls over the same set never hand out a port twice.
    pub fn allocate(&self, used: &mut BTreeSet<u16>) -> Result<u16> {
        let port = (self.start..self.end)
            .find(|port| !used.contains(port))
            .ok_or(RuntimeError::NoFreePort {
                start: self.start,
                end: self.end,
            })?;
        used.insert(port);
        Ok(port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
