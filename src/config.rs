//! Runtime-tunable configuration.
//!
//! Every knob the kernel implementation exposes through sysctl is a
//! field here; [`HomaConfig::set`] accepts the same names as strings so
//! hosts can wire this to whatever configuration surface they have.

use serde::{Deserialize, Serialize};

use crate::error::HomaError;
use crate::type_alias::*;

/// Largest permissible message, in bytes (default for
/// `max_message_length`).
pub const HOMA_MAX_MESSAGE_LENGTH: usize = 1_000_000;

/// Number of priority levels the wire format can express.
pub const HOMA_MAX_PRIORITIES: usize = 8;

/// The 16-bit port space is split in two: ports `1..0x8000` are bindable
/// server ports, ports `0x8000..` are allocated automatically as client
/// ports. Port 0 is reserved.
pub const HOMA_MIN_CLIENT_PORT: Port = 0x8000;

/// Homa's protocol number within the IP protocol space (not an
/// officially allocated slot).
pub const IPPROTO_HOMA: u8 = 0xFD;

/// Size of an IPv4 header, used when estimating wire bytes.
pub(crate) const IPV4_HEADER_LENGTH: usize = 20;

/// Bytes of an Ethernet VLAN header.
pub(crate) const VLAN_HEADER: usize = 20;

/// Per-packet Ethernet overhead: CRC, preamble and inter-packet gap.
pub(crate) const ETH_OVERHEAD: usize = 24;

/// Transport tunables. See the field docs for meanings; defaults follow
/// the reference implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HomaConfig {
    /// Estimate of the data that can be in flight during one round trip;
    /// sets the unscheduled window and the grant horizon. Rounded up to
    /// full packets during message assembly.
    pub rtt_bytes: u32,

    /// Uplink bandwidth in units of 1e6 bits per second; drives the
    /// NIC-queue estimator.
    pub link_mbps: u32,

    /// Priority levels in use, `1..=HOMA_MAX_PRIORITIES`.
    pub num_priorities: u8,

    /// Added to every internal priority before handing packets to the
    /// host's VLAN mapping.
    pub base_priority: u8,

    /// Highest priority level used for scheduled (granted) packets;
    /// levels above it are reserved for unscheduled traffic.
    pub max_sched_prio: Priority,

    /// Entry `i` is the largest message size that uses priority `i` for
    /// its unscheduled packets (larger `i` is higher priority).
    pub unsched_cutoffs: [u32; HOMA_MAX_PRIORITIES],

    /// Version stamp for `unsched_cutoffs`; bumped on every change and
    /// carried in outbound packets so peers notice staleness.
    pub cutoff_version: u16,

    /// Additional bytes authorized by each GRANT.
    pub grant_increment: u32,

    /// Maximum number of inbound messages granted to simultaneously.
    pub max_overcommit: usize,

    /// Silent ticks before the first RESEND for an RPC.
    pub resend_ticks: u32,

    /// Minimum ticks between RESENDs to the same peer.
    pub resend_interval: u32,

    /// Abort an RPC after this many fruitless RESENDs.
    pub abort_resends: u32,

    /// Packets smaller than this bypass the throttle machinery.
    pub throttle_min_bytes: u32,

    /// NIC queue depth limit, in nanoseconds of transmit time.
    pub max_nic_queue_ns: u64,

    /// Upper bound on the size of a segmentation-offload buffer.
    pub max_gso_size: usize,

    /// Receive-aggregation bound. Accepted for sysctl compatibility;
    /// aggregation happens in the host stack, outside this core.
    pub max_gro_skbs: usize,

    /// Maximum packet buffers released per reap pass.
    pub reap_limit: usize,

    /// Dead packet buffers tolerated before reaping turns aggressive.
    pub max_dead_buffs: usize,

    /// Cap on message length.
    pub max_message_length: usize,
}

impl Default for HomaConfig {
    fn default() -> Self {
        let mut cutoffs = [0; HOMA_MAX_PRIORITIES];
        cutoffs[HOMA_MAX_PRIORITIES - 1] = 200;
        cutoffs[HOMA_MAX_PRIORITIES - 2] = 2800;
        cutoffs[HOMA_MAX_PRIORITIES - 3] = 15000;
        cutoffs[HOMA_MAX_PRIORITIES - 4] = HOMA_MAX_MESSAGE_LENGTH as u32;
        Self {
            rtt_bytes: 10000,
            link_mbps: 10000,
            num_priorities: HOMA_MAX_PRIORITIES as u8,
            base_priority: 1,
            max_sched_prio: 3,
            unsched_cutoffs: cutoffs,
            cutoff_version: 1,
            grant_increment: 10000,
            max_overcommit: 8,
            resend_ticks: 2,
            resend_interval: 5,
            abort_resends: 10,
            throttle_min_bytes: 300,
            max_nic_queue_ns: 2000,
            max_gso_size: 1_000_000,
            max_gro_skbs: 20,
            reap_limit: 10,
            max_dead_buffs: 10000,
            max_message_length: HOMA_MAX_MESSAGE_LENGTH,
        }
    }
}

impl HomaConfig {
    /// Set one option by its sysctl name. `unsched_cutoffs` takes a
    /// comma-separated list of up to eight sizes.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), HomaError> {
        fn num<T: std::str::FromStr>(value: &str) -> Result<T, HomaError> {
            value
                .trim()
                .parse()
                .map_err(|_| HomaError::InvalidArgument("unparsable option value"))
        }

        let mut prios = false;
        match name {
            "rtt_bytes" => self.rtt_bytes = num(value)?,
            "link_mbps" => self.link_mbps = num(value)?,
            "num_priorities" => {
                self.num_priorities = num(value)?;
                prios = true;
            }
            "base_priority" => self.base_priority = num(value)?,
            "max_sched_prio" => {
                self.max_sched_prio = num(value)?;
                prios = true;
            }
            "unsched_cutoffs" => {
                let mut cutoffs = [0; HOMA_MAX_PRIORITIES];
                for (i, part) in value.split(',').enumerate() {
                    if i >= HOMA_MAX_PRIORITIES {
                        return Err(HomaError::InvalidArgument("too many cutoffs"));
                    }
                    cutoffs[i] = num(part)?;
                }
                self.unsched_cutoffs = cutoffs;
                prios = true;
            }
            "grant_increment" => self.grant_increment = num(value)?,
            "max_overcommit" => self.max_overcommit = num(value)?,
            "resend_ticks" => self.resend_ticks = num(value)?,
            "resend_interval" => self.resend_interval = num(value)?,
            "abort_resends" => self.abort_resends = num(value)?,
            "throttle_min_bytes" => self.throttle_min_bytes = num(value)?,
            "max_nic_queue_ns" => self.max_nic_queue_ns = num(value)?,
            "max_gso_size" => self.max_gso_size = num(value)?,
            "max_gro_skbs" => self.max_gro_skbs = num(value)?,
            "reap_limit" => self.reap_limit = num(value)?,
            "max_dead_buffs" => self.max_dead_buffs = num(value)?,
            "max_message_length" => self.max_message_length = num(value)?,
            _ => return Err(HomaError::InvalidArgument("unrecognized option name")),
        }
        if prios {
            self.prios_changed();
        }
        Ok(())
    }

    /// Re-establish priority-configuration invariants after a change:
    /// clamp `num_priorities`, force cutoff 0 to catch everything, and
    /// derive `max_sched_prio` from the first cutoff that covers the
    /// whole message-size range.
    pub(crate) fn prios_changed(&mut self) {
        if self.num_priorities as usize > HOMA_MAX_PRIORITIES {
            self.num_priorities = HOMA_MAX_PRIORITIES as u8;
        }
        if self.num_priorities == 0 {
            self.num_priorities = 1;
        }

        // Priority 0 must match any length that falls through the rest.
        self.unsched_cutoffs[0] = u32::MAX;

        let mut i = HOMA_MAX_PRIORITIES - 1;
        loop {
            if i >= self.num_priorities as usize {
                self.unsched_cutoffs[i] = 0;
            } else if i == 0 {
                self.max_sched_prio = 0;
                break;
            } else if self.unsched_cutoffs[i] >= self.max_message_length as u32 {
                self.max_sched_prio = (i - 1) as Priority;
                break;
            }
            i -= 1;
        }
        self.cutoff_version = self.cutoff_version.wrapping_add(1).max(1);
    }

    /// Cycles needed to put 1000 bytes on the wire, deliberately
    /// overestimated by 5% so the queue estimate never runs dry.
    pub(crate) fn cycles_per_kbyte(&self, cycles_per_sec: u64) -> u64 {
        let raw = 8 * cycles_per_sec / (1000 * self.link_mbps.max(1) as u64);
        raw * 105 / 100
    }

    /// `max_nic_queue_ns` converted to cycle units.
    pub(crate) fn max_nic_queue_cycles(&self, cycles_per_sec: u64) -> u64 {
        self.max_nic_queue_ns * cycles_per_sec / 1_000_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_recognizes_sysctl_names() {
        let mut cfg = HomaConfig::default();
        cfg.set("rtt_bytes", "60000").unwrap();
        cfg.set("grant_increment", "10000").unwrap();
        cfg.set("unsched_cutoffs", "0,0,0,0,1000000,15000,2800,200")
            .unwrap();
        assert_eq!(cfg.rtt_bytes, 60000);
        assert_eq!(cfg.unsched_cutoffs[5], 15000);
        assert!(cfg.set("no_such_option", "1").is_err());
        assert!(cfg.set("rtt_bytes", "bogus").is_err());
    }

    #[test]
    fn prios_changed_normalizes() {
        let mut cfg = HomaConfig::default();
        let v0 = cfg.cutoff_version;
        cfg.prios_changed();
        assert_eq!(cfg.unsched_cutoffs[0], u32::MAX);
        // Cutoff 4 covers the maximum message size, so levels 0..=3 are
        // left for scheduled traffic.
        assert_eq!(cfg.max_sched_prio, 3);
        assert_ne!(cfg.cutoff_version, v0);
    }

    #[test]
    fn wire_rate_derivation() {
        let cfg = HomaConfig {
            link_mbps: 10000,
            max_nic_queue_ns: 2000,
            ..Default::default()
        };
        // 10 Gbps: 800 ns/KB, plus the 5% margin.
        assert_eq!(cfg.cycles_per_kbyte(1_000_000_000), 840);
        assert_eq!(cfg.max_nic_queue_cycles(1_000_000_000), 2000);
    }
}
