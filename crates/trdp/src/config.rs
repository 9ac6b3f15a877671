//! Session configuration consumed at open time.
//!
//! The stack does not parse configuration files; an external loader (XML
//! in the reference tooling) builds these structs and hands them to
//! [`crate::session::Registry::open_session`]. Everything here is plain
//! data plus the default callbacks inherited by subscriptions and
//! listeners that do not bring their own.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::md::MdCallback;
use crate::pd::PdCallback;
use crate::time::TimeVal;
use crate::wire::{MD_PORT, PD_UDP_PORT};

/// Per-telegram option flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PktFlags {
    /// Marshall on put / unmarshall on delivery using the session's
    /// dataset tables.
    pub marshall: bool,
    /// Deliver data through the callback (in addition to `get`).
    pub callback: bool,
    /// The publication belongs to a redundancy group and keeps
    /// transmitting while the session is follower.
    pub redundant: bool,
    /// Use TCP transport (message data only).
    pub tcp: bool,
}

/// What `get` returns for a subscription whose supervision interval
/// expired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimeoutBehavior {
    /// Inherit the session default.
    #[default]
    Default,
    /// Zero the cached payload.
    SetToZero,
    /// Keep the last valid payload.
    KeepLast,
}

/// Quality of service and time-to-live for egress frames.
///
/// `qos` maps to the IP TOS field (shifted into the precedence bits),
/// `ttl` to the unicast or multicast TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SendParam {
    /// Quality of service class, 0..=7.
    pub qos: u8,
    /// IP time-to-live.
    pub ttl: u8,
}

impl SendParam {
    /// Default for process data.
    pub const PD: SendParam = SendParam { qos: 5, ttl: 64 };
    /// Default for message data.
    pub const MD: SendParam = SendParam { qos: 3, ttl: 64 };
}

/// Process data defaults for a session.
#[derive(Clone)]
pub struct PdConfig {
    /// Callback for subscriptions registered without one.
    pub callback: Option<Arc<PdCallback>>,
    /// Opaque token handed back in every event.
    pub user_ref: usize,
    /// Egress QoS and TTL.
    pub send_param: SendParam,
    /// Default flags merged into publish/subscribe calls.
    pub flags: PktFlags,
    /// Default supervision interval for subscriptions.
    pub timeout: TimeVal,
    /// Default timeout behavior for subscriptions.
    pub timeout_behavior: TimeoutBehavior,
    /// UDP port for process data.
    pub port: u16,
}

impl Default for PdConfig {
    fn default() -> Self {
        PdConfig {
            callback: None,
            user_ref: 0,
            send_param: SendParam::PD,
            flags: PktFlags::default(),
            timeout: TimeVal::ZERO,
            timeout_behavior: TimeoutBehavior::SetToZero,
            port: PD_UDP_PORT,
        }
    }
}

impl fmt::Debug for PdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdConfig")
            .field("callback", &self.callback.is_some())
            .field("user_ref", &self.user_ref)
            .field("send_param", &self.send_param)
            .field("flags", &self.flags)
            .field("timeout", &self.timeout)
            .field("timeout_behavior", &self.timeout_behavior)
            .field("port", &self.port)
            .finish()
    }
}

/// Message data defaults for a session.
#[derive(Clone)]
pub struct MdConfig {
    /// Callback for listeners registered without one and for caller
    /// transactions.
    pub callback: Option<Arc<MdCallback>>,
    /// Opaque token handed back in every event.
    pub user_ref: usize,
    /// Egress QoS and TTL.
    pub send_param: SendParam,
    /// Default flags merged into listener/request calls.
    pub flags: PktFlags,
    /// Default supervision interval for the first reply.
    pub reply_timeout: TimeVal,
    /// Replier-side supervision interval for the caller's confirm.
    pub confirm_timeout: TimeVal,
    /// Idle interval after which an unused TCP connection is closed.
    pub connect_timeout: TimeVal,
    /// Default retransmission budget for requests.
    pub num_retries_max: u32,
    /// UDP port for message data.
    pub udp_port: u16,
    /// TCP port for message data.
    pub tcp_port: u16,
}

impl Default for MdConfig {
    fn default() -> Self {
        MdConfig {
            callback: None,
            user_ref: 0,
            send_param: SendParam::MD,
            flags: PktFlags::default(),
            reply_timeout: TimeVal::new(5, 0),
            confirm_timeout: TimeVal::new(1, 0),
            connect_timeout: TimeVal::new(60, 0),
            num_retries_max: 0,
            udp_port: MD_PORT,
            tcp_port: MD_PORT,
        }
    }
}

impl fmt::Debug for MdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MdConfig")
            .field("callback", &self.callback.is_some())
            .field("user_ref", &self.user_ref)
            .field("send_param", &self.send_param)
            .field("flags", &self.flags)
            .field("reply_timeout", &self.reply_timeout)
            .field("confirm_timeout", &self.confirm_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("num_retries_max", &self.num_retries_max)
            .field("udp_port", &self.udp_port)
            .field("tcp_port", &self.tcp_port)
            .finish()
    }
}

/// Scheduling options for the session's process loop.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcessConfig {
    /// Host name announced in statistics.
    pub host_name: String,
    /// Redundancy leader name announced in statistics.
    pub leader_name: String,
    /// Spread publication start offsets so egress load is uniform over
    /// each cycle instead of bursting at open time.
    pub traffic_shaping: bool,
}

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Own IP address frames are sent from; also the default bind
    /// address.
    pub own_ip: Ipv4Addr,
    /// Redundancy leader (virtual) IP address, unspecified when not
    /// redundant.
    pub leader_ip: Ipv4Addr,
    /// Process data defaults.
    pub pd: PdConfig,
    /// Message data defaults.
    pub md: MdConfig,
    /// Process loop options.
    pub process: ProcessConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            own_ip: Ipv4Addr::UNSPECIFIED,
            leader_ip: Ipv4Addr::UNSPECIFIED,
            pd: PdConfig::default(),
            md: MdConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}
