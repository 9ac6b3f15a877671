//! Per-session statistics counters.
//!
//! Counters are bumped inside the engines under the session lock and read
//! out by value through the session façade. They are diagnostics, not
//! control state: nothing in the stack branches on them.

use crate::time::TimeVal;

/// Process data counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PdStats {
    /// Valid telegrams received.
    pub rx: u64,
    /// Telegrams sent.
    pub tx: u64,
    /// Ingress frames dropped for a check sequence mismatch.
    pub crc_err: u64,
    /// Ingress frames dropped as malformed (length, version, type).
    pub prot_err: u64,
    /// Ingress frames dropped for stale topography counters.
    pub topo_err: u64,
    /// Valid frames with no matching subscription.
    pub no_subs: u64,
    /// Subscription supervision intervals that expired.
    pub timeouts: u64,
    /// Receive gaps observed via the sequence counter.
    pub missed: u64,
}

/// Message data counters, kept separately for UDP and TCP transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MdStats {
    /// Valid messages received.
    pub rx: u64,
    /// Messages sent, retransmissions included.
    pub tx: u64,
    /// Ingress frames dropped for a check sequence mismatch.
    pub crc_err: u64,
    /// Ingress frames dropped as malformed (length, version, type).
    pub prot_err: u64,
    /// Ingress frames dropped for stale topography counters.
    pub topo_err: u64,
    /// Valid messages matching neither a listener nor a caller session.
    pub no_listener: u64,
    /// Caller transactions that ended in a reply timeout.
    pub reply_timeouts: u64,
    /// Replier transactions that ended in a confirm timeout.
    pub confirm_timeouts: u64,
}

/// All counters of one session.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionStats {
    /// Monotonic time the session was opened.
    pub since: TimeVal,
    /// Multicast groups currently joined across the socket pool.
    pub joined_mc: u32,
    /// Publications currently registered.
    pub publications: u32,
    /// Subscriptions currently registered.
    pub subscriptions: u32,
    /// Listeners currently registered.
    pub listeners: u32,
    /// MD transactions currently in flight (caller and replier side).
    pub md_sessions: u32,
    /// Process data counters.
    pub pd: PdStats,
    /// Message data counters over UDP.
    pub udp_md: MdStats,
    /// Message data counters over TCP.
    pub tcp_md: MdStats,
}

impl SessionStats {
    /// Zero every counter, keeping the session start time.
    pub fn reset(&mut self) {
        *self = SessionStats {
            since: self.since,
            ..SessionStats::default()
        };
    }

    /// Counters for the MD transport selected by `tcp`.
    pub fn md_mut(&mut self, tcp: bool) -> &mut MdStats {
        if tcp { &mut self.tcp_md } else { &mut self.udp_md }
    }
}
