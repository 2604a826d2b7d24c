//! Classification and report types for NAT discovery

use crate::transport::ProbeOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Terminal result of a discovery run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NatClassification {
    /// Publicly addressable, accepts traffic from unexpected sources
    Public,
    /// Publicly addressable, but a firewall drops unsolicited traffic
    SymmetricFirewall,
    /// Any external host can reach the existing mapping
    FullCone,
    /// A distinct external mapping per local socket
    SymmetricNat,
    /// Inbound traffic must match a contacted IP and port
    PortRestricted,
    /// Inbound traffic must match a contacted IP, any port
    Restricted,
    /// The discovery server could not be reached
    Unreachable,
}

impl NatClassification {
    /// Stable numeric code (`Unreachable=0`, `Public=1` ... `Restricted=6`)
    pub fn code(self) -> u8 {
        match self {
            Self::Unreachable => 0,
            Self::Public => 1,
            Self::SymmetricFirewall => 2,
            Self::FullCone => 3,
            Self::SymmetricNat => 4,
            Self::PortRestricted => 5,
            Self::Restricted => 6,
        }
    }

    /// Unsolicited inbound UDP reaches the host without prior outbound traffic
    pub fn accepts_unsolicited(self) -> bool {
        matches!(self, Self::Public | Self::FullCone)
    }

    /// Direct peer-to-peer UDP is not feasible and a relay is needed
    pub fn requires_relay(self) -> bool {
        matches!(self, Self::SymmetricNat | Self::Unreachable)
    }

    /// Direct peer-to-peer UDP (possibly after hole punching) is feasible
    pub fn is_direct_connectivity_possible(self) -> bool {
        !self.requires_relay()
    }
}

impl fmt::Display for NatClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Public => "Public",
            Self::SymmetricFirewall => "Symmetric UDP firewall",
            Self::FullCone => "Full-cone NAT",
            Self::SymmetricNat => "Symmetric NAT",
            Self::PortRestricted => "Port-restricted NAT",
            Self::Restricted => "Restricted NAT",
            Self::Unreachable => "Unreachable",
        };
        f.write_str(name)
    }
}

/// Discovery steps in the order they can run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DiscoveryStep {
    /// `Ping` to the primary listener
    Reachability,
    /// `PublicCheck`, reply expected from the secondary listener
    Firewall,
    /// `FullConeCheck`, reply expected from the secondary listener
    FullCone,
    /// `Ping` from two local sockets, mappings compared
    SymmetricNat,
    /// `PortRestrictedCheck`, reply expected from the tertiary listener
    PortRestriction,
}

impl fmt::Display for DiscoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reachability => "Reachability",
            Self::Firewall => "Firewall",
            Self::FullCone => "Full-cone",
            Self::SymmetricNat => "Symmetric",
            Self::PortRestriction => "Port restriction",
        };
        f.write_str(name)
    }
}

/// Evidence gathered by one step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepRecord {
    /// Which step ran
    pub step: DiscoveryStep,
    /// Probe batches the step sent (two for the symmetric check)
    pub outcomes: Vec<ProbeOutcome>,
    /// Short description of what the step concluded
    pub verdict: String,
}

/// Full record of a discovery run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Identifier used in this run's log lines
    pub run_id: Uuid,
    /// Unix timestamp in milliseconds when the run started
    pub started_at_ms: i64,
    /// Wall-clock duration of the run in milliseconds
    pub elapsed_ms: u64,
    /// Local address of the primary probe socket
    pub local_addr: Option<String>,
    /// Steps in execution order
    pub steps: Vec<StepRecord>,
    /// Terminal classification
    pub classification: NatClassification,
}

impl DiscoveryReport {
    /// Steps that ran, in order
    pub fn step_sequence(&self) -> Vec<DiscoveryStep> {
        self.steps.iter().map(|record| record.step).collect()
    }

    /// One-line chain of step verdicts (for UX display)
    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .steps
            .iter()
            .map(|record| format!("{}: {}", record.step, record.verdict))
            .collect();
        parts.push(format!("result: {}", self.classification));
        parts.join(" → ")
    }
}
