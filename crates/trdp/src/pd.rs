//! Process data engine: periodic publish/subscribe with deadline
//! supervision.
//!
//! Publications are telegrams the session owns and retransmits on a fixed
//! cycle; subscriptions are receive slots with a supervision interval and
//! a latched timeout. Both live in per-session tables keyed by an opaque
//! handle, with the `(comId, srcIp, destIp)` tuple unique per table. All
//! scheduling goes through the session's deadline index; the engine only
//! reacts to `on_send_due` / `on_timeout_due` dispatches and to drained
//! datagrams.

use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::config::{PdConfig, PktFlags, SendParam, TimeoutBehavior};
use crate::error::{Result, ResultCode, TrdpError};
use crate::session::EngineCtx;
use crate::sock::SockKind;
use crate::time::TimeVal;
use crate::timers::TimerKey;
use crate::wire::{self, MAX_PD_DATA, MsgType};

/// Minimum publish interval / subscribe timeout.
pub const MIN_INTERVAL: TimeVal = TimeVal::from_micros(10_000);

/// Handle to a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubHandle(pub(crate) u32);

/// Handle to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubHandle(pub(crate) u32);

/// Callback invoked for subscription events, outside the session lock.
pub type PdCallback = dyn Fn(&PdEvent) + Send + Sync;

/// Metadata delivered with every subscription event.
#[derive(Debug, Clone)]
pub struct PdInfo {
    /// Telegram identifier.
    pub com_id: u32,
    /// Sender address (zero on timeout events).
    pub src_ip: Ipv4Addr,
    /// Subscribed destination address.
    pub dest_ip: Ipv4Addr,
    /// Topography counters carried by the frame.
    pub topo: (u32, u32),
    /// Message type of the frame.
    pub msg_type: MsgType,
    /// Sequence counter of the frame.
    pub seq: u32,
    /// Token supplied at subscribe time.
    pub user_ref: usize,
    /// `Ok` or `Timeout`.
    pub result: ResultCode,
}

/// A subscription event: metadata plus the (possibly unmarshalled)
/// payload. Timeout events carry an empty payload.
#[derive(Debug, Clone)]
pub struct PdEvent {
    /// Event metadata.
    pub info: PdInfo,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Deferred deliveries collected under the lock, fired after it.
pub(crate) type PdDeliveries = Vec<(Arc<PdCallback>, PdEvent)>;

/// Parameters for [`crate::session::Session::publish`].
#[derive(Debug, Clone)]
pub struct PublishSpec {
    /// Telegram identifier, non-zero.
    pub com_id: u32,
    /// Source address; unspecified means the session's own address.
    pub src_ip: Ipv4Addr,
    /// Destination address, unicast or multicast, non-zero.
    pub dest_ip: Ipv4Addr,
    /// Send cycle.
    pub interval: TimeVal,
    /// Redundancy group, zero for none.
    pub red_id: u32,
    /// Flags; `None` inherits the session default.
    pub flags: Option<PktFlags>,
    /// QoS/TTL; `None` inherits the session default.
    pub send_param: Option<SendParam>,
    /// Initial payload (host layout when the marshall flag is set).
    pub data: Vec<u8>,
}

impl Default for PublishSpec {
    fn default() -> Self {
        Self {
            com_id: 0,
            src_ip: Ipv4Addr::UNSPECIFIED,
            dest_ip: Ipv4Addr::UNSPECIFIED,
            interval: TimeVal::default(),
            red_id: 0,
            flags: None,
            send_param: None,
            data: Vec::new(),
        }
    }
}

/// Parameters for [`crate::session::Session::subscribe`].
#[derive(Clone)]
pub struct SubscribeSpec {
    /// Telegram identifier, non-zero.
    pub com_id: u32,
    /// First source filter; unspecified accepts any sender.
    pub src_ip1: Ipv4Addr,
    /// Second source filter, for redundant sender pairs.
    pub src_ip2: Ipv4Addr,
    /// Destination address; multicast destinations are joined.
    pub dest_ip: Ipv4Addr,
    /// Supervision interval; zero inherits the session default, and a
    /// zero default disables supervision.
    pub timeout: TimeVal,
    /// What `get` returns after a timeout.
    pub behavior: TimeoutBehavior,
    /// Largest expected payload.
    pub max_size: usize,
    /// Flags; `None` inherits the session default.
    pub flags: Option<PktFlags>,
    /// Token handed back in every event.
    pub user_ref: usize,
    /// Callback; `None` inherits the session default.
    pub callback: Option<Arc<PdCallback>>,
}

impl Default for SubscribeSpec {
    fn default() -> Self {
        Self {
            com_id: 0,
            src_ip1: Ipv4Addr::UNSPECIFIED,
            src_ip2: Ipv4Addr::UNSPECIFIED,
            dest_ip: Ipv4Addr::UNSPECIFIED,
            timeout: TimeVal::default(),
            behavior: TimeoutBehavior::default(),
            max_size: 0,
            flags: None,
            user_ref: 0,
            callback: None,
        }
    }
}

impl std::fmt::Debug for SubscribeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeSpec")
            .field("com_id", &self.com_id)
            .field("src_ip1", &self.src_ip1)
            .field("src_ip2", &self.src_ip2)
            .field("dest_ip", &self.dest_ip)
            .field("timeout", &self.timeout)
            .field("behavior", &self.behavior)
            .field("max_size", &self.max_size)
            .field("flags", &self.flags)
            .field("user_ref", &self.user_ref)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

struct PdElement {
    id: u32,
    com_id: u32,
    src_ip: Ipv4Addr,
    src_ip2: Ipv4Addr,
    dest_ip: Ipv4Addr,
    mc_group: Option<Ipv4Addr>,
    interval: TimeVal,
    flags: PktFlags,
    behavior: TimeoutBehavior,
    red_id: u32,
    timed_out: bool,
    sock_idx: usize,
    dest_port: u16,
    seq: u32,
    /// Publisher: the sealed frame. Subscriber: last valid payload.
    buf: BytesMut,
    data_size: usize,
    max_size: usize,
    user_ref: usize,
    callback: Option<Arc<PdCallback>>,
    last_seq: Option<u32>,
    num_rx_tx: u64,
    num_missed: u64,
    got_data: bool,
    _charge: crate::mem::MemCharge,
}

impl PdElement {
    fn key(&self) -> (u32, Ipv4Addr, Ipv4Addr) {
        (self.com_id, self.src_ip, self.dest_ip)
    }
}

/// The PD engine of one session.
#[derive(Default)]
pub(crate) struct PdEngine {
    send: Vec<PdElement>,
    recv: Vec<PdElement>,
    next_id: u32,
}

impl PdEngine {
    fn fresh_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Register a publication and arm its first send deadline.
    pub(crate) fn publish(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        spec: &PublishSpec,
        defaults: &PdConfig,
        own_ip: Ipv4Addr,
        traffic_shaping: bool,
    ) -> Result<PubHandle> {
        if spec.com_id == 0 {
            return Err(TrdpError::param("comId must be non-zero"));
        }
        if spec.dest_ip.is_unspecified() {
            return Err(TrdpError::param("destination address must be set"));
        }
        if spec.interval < MIN_INTERVAL {
            return Err(TrdpError::param(format!(
                "interval below {} us",
                MIN_INTERVAL.as_micros()
            )));
        }
        let src_ip = if spec.src_ip.is_unspecified() { own_ip } else { spec.src_ip };
        if self
            .send
            .iter()
            .any(|e| e.key() == (spec.com_id, src_ip, spec.dest_ip))
        {
            return Err(TrdpError::NoPublish);
        }

        let flags = spec.flags.unwrap_or(defaults.flags);
        let payload = self.outbound_payload(ctx, spec.com_id, flags, &spec.data)?;
        if payload.len() > MAX_PD_DATA {
            return Err(TrdpError::param(format!(
                "payload {} exceeds PD maximum {MAX_PD_DATA}",
                payload.len()
            )));
        }

        let charge = ctx.mem.alloc(wire::pd_gross_size(payload.len()))?;
        let send_param = spec.send_param.unwrap_or(defaults.send_param);
        // Egress sockets bind an ephemeral port; the PD port is where
        // the frames go, not where they come from.
        let sock_idx = ctx.pool.request_udp(SockKind::PdUdp, src_ip, 0, send_param)?;

        let id = self.fresh_id();
        let time_to_go = if traffic_shaping {
            self.shaped_start(ctx.now, spec.interval)
        } else {
            ctx.now + spec.interval
        };

        let frame = wire::build_pd(MsgType::Pd, spec.com_id, ctx.topo, 0, 0, &payload);
        self.send.push(PdElement {
            id,
            com_id: spec.com_id,
            src_ip,
            src_ip2: Ipv4Addr::UNSPECIFIED,
            dest_ip: spec.dest_ip,
            mc_group: mc_group(spec.dest_ip),
            interval: spec.interval,
            flags,
            behavior: TimeoutBehavior::Default,
            red_id: spec.red_id,
            timed_out: false,
            sock_idx,
            dest_port: defaults.port,
            seq: 0,
            data_size: payload.len(),
            buf: frame,
            max_size: MAX_PD_DATA,
            user_ref: defaults.user_ref,
            callback: None,
            last_seq: None,
            num_rx_tx: 0,
            num_missed: 0,
            got_data: !spec.data.is_empty(),
            _charge: charge,
        });
        ctx.timers.schedule(TimerKey::PdSend(id), time_to_go);
        debug!(com_id = spec.com_id, %src_ip, dest = %spec.dest_ip, "published");
        Ok(PubHandle(id))
    }

    /// Remove a publication and drop its socket reference.
    pub(crate) fn unpublish(&mut self, ctx: &mut EngineCtx<'_>, handle: PubHandle) -> Result<()> {
        let pos = self
            .send
            .iter()
            .position(|e| e.id == handle.0)
            .ok_or(TrdpError::NoPublish)?;
        let element = self.send.remove(pos);
        ctx.timers.cancel(TimerKey::PdSend(element.id));
        ctx.pool.release(element.sock_idx, ctx.now, TimeVal::ZERO)?;
        Ok(())
    }

    /// Update the payload of a publication. The new data goes out with
    /// the next due send; the schedule is untouched.
    pub(crate) fn put(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        handle: PubHandle,
        data: &[u8],
    ) -> Result<()> {
        let payload = {
            let element = self
                .send
                .iter()
                .find(|e| e.id == handle.0)
                .ok_or(TrdpError::NoPublish)?;
            self.outbound_payload(ctx, element.com_id, element.flags, data)?
        };
        if payload.len() > MAX_PD_DATA {
            return Err(TrdpError::param(format!(
                "payload {} exceeds PD maximum {MAX_PD_DATA}",
                payload.len()
            )));
        }
        let element = self
            .send
            .iter_mut()
            .find(|e| e.id == handle.0)
            .expect("present above");
        if wire::pd_gross_size(payload.len()) > element._charge.block_size() {
            element._charge = ctx.mem.alloc(wire::pd_gross_size(payload.len()))?;
        }
        wire::set_pd_payload(&mut element.buf, &payload);
        element.data_size = payload.len();
        element.got_data = true;
        Ok(())
    }

    fn outbound_payload(
        &self,
        ctx: &EngineCtx<'_>,
        com_id: u32,
        flags: PktFlags,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        if !flags.marshall || data.is_empty() {
            return Ok(data.to_vec());
        }
        let marshalling = ctx
            .marshalling
            .ok_or_else(|| TrdpError::param("marshall flag set without dataset tables"))?;
        let size = marshalling.wire_size(com_id, data)?;
        let mut wire_buf = vec![0u8; size];
        marshalling.marshall(com_id, data, &mut wire_buf)?;
        Ok(wire_buf)
    }

    /// Register a subscription, join multicast when the destination
    /// calls for it, arm supervision.
    pub(crate) fn subscribe(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        spec: &SubscribeSpec,
        defaults: &PdConfig,
        own_ip: Ipv4Addr,
    ) -> Result<SubHandle> {
        if spec.com_id == 0 {
            return Err(TrdpError::param("comId must be non-zero"));
        }
        if spec.max_size == 0 || spec.max_size > MAX_PD_DATA {
            return Err(TrdpError::param(format!(
                "max payload size {} out of range",
                spec.max_size
            )));
        }
        if self
            .recv
            .iter()
            .any(|e| e.key() == (spec.com_id, spec.src_ip1, spec.dest_ip))
        {
            return Err(TrdpError::NoSubscribe);
        }
        let timeout = if spec.timeout.is_zero() { defaults.timeout } else { spec.timeout };
        if !timeout.is_zero() && timeout < MIN_INTERVAL {
            return Err(TrdpError::param(format!(
                "timeout below {} us",
                MIN_INTERVAL.as_micros()
            )));
        }

        let charge = ctx.mem.alloc(wire::pd_gross_size(spec.max_size))?;
        let group = mc_group(spec.dest_ip);
        // Multicast reception binds the wildcard address; unicast binds
        // the own address so several sessions can coexist on one host.
        let bind_ip = if group.is_some() { Ipv4Addr::UNSPECIFIED } else { own_ip };
        let sock_idx =
            ctx.pool
                .request_udp(SockKind::PdUdp, bind_ip, defaults.port, defaults.send_param)?;
        if let Some(group) = group {
            if let Err(e) = ctx.pool.join_multicast(sock_idx, group, own_ip) {
                ctx.pool.release(sock_idx, ctx.now, TimeVal::ZERO)?;
                return Err(e);
            }
        }

        let id = self.fresh_id();
        let behavior = match spec.behavior {
            TimeoutBehavior::Default => defaults.timeout_behavior,
            other => other,
        };
        self.recv.push(PdElement {
            id,
            com_id: spec.com_id,
            src_ip: spec.src_ip1,
            src_ip2: spec.src_ip2,
            dest_ip: spec.dest_ip,
            mc_group: group,
            interval: timeout,
            flags: spec.flags.unwrap_or(defaults.flags),
            behavior,
            red_id: 0,
            timed_out: false,
            sock_idx,
            dest_port: defaults.port,
            seq: 0,
            data_size: 0,
            buf: BytesMut::new(),
            max_size: spec.max_size,
            user_ref: spec.user_ref,
            callback: spec.callback.clone().or_else(|| defaults.callback.clone()),
            last_seq: None,
            num_rx_tx: 0,
            num_missed: 0,
            got_data: false,
            _charge: charge,
        });
        if !timeout.is_zero() {
            ctx.timers.schedule(TimerKey::PdTimeout(id), ctx.now + timeout);
        }
        debug!(com_id = spec.com_id, dest = %spec.dest_ip, "subscribed");
        Ok(SubHandle(id))
    }

    /// Remove a subscription from the receive table, leaving its
    /// multicast group when no other subscription shares it.
    pub(crate) fn unsubscribe(&mut self, ctx: &mut EngineCtx<'_>, handle: SubHandle) -> Result<()> {
        let pos = self
            .recv
            .iter()
            .position(|e| e.id == handle.0)
            .ok_or(TrdpError::NoSubscribe)?;
        let element = self.recv.remove(pos);
        ctx.timers.cancel(TimerKey::PdTimeout(element.id));
        if let Some(group) = element.mc_group {
            let shared = self
                .recv
                .iter()
                .any(|e| e.sock_idx == element.sock_idx && e.mc_group == Some(group));
            if !shared {
                ctx.pool
                    .leave_multicast(element.sock_idx, group, Ipv4Addr::UNSPECIFIED)?;
            }
        }
        ctx.pool.release(element.sock_idx, ctx.now, TimeVal::ZERO)?;
        Ok(())
    }

    /// Last valid payload of a subscription, unmarshalled when the flag
    /// asks for it, with the timeout state reflected in the result code.
    pub(crate) fn get(&self, ctx: &EngineCtx<'_>, handle: SubHandle) -> Result<(Vec<u8>, PdInfo)> {
        let element = self
            .recv
            .iter()
            .find(|e| e.id == handle.0)
            .ok_or(TrdpError::NoSubscribe)?;
        if !element.got_data {
            return Err(TrdpError::NoData);
        }
        let payload = self.inbound_payload(ctx, element, &element.buf[..element.data_size])?;
        let info = PdInfo {
            com_id: element.com_id,
            src_ip: element.src_ip,
            dest_ip: element.dest_ip,
            topo: ctx.topo,
            msg_type: MsgType::Pd,
            seq: element.last_seq.unwrap_or(0),
            user_ref: element.user_ref,
            result: if element.timed_out { ResultCode::Timeout } else { ResultCode::Ok },
        };
        Ok((payload, info))
    }

    fn inbound_payload(
        &self,
        ctx: &EngineCtx<'_>,
        element: &PdElement,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        if !element.flags.marshall || data.is_empty() {
            return Ok(data.to_vec());
        }
        let marshalling = ctx
            .marshalling
            .ok_or_else(|| TrdpError::param("marshall flag set without dataset tables"))?;
        let size = marshalling.host_size(element.com_id, data)?;
        let mut host = vec![0u8; size];
        marshalling.unmarshall(element.com_id, data, &mut host)?;
        Ok(host)
    }

    /// A publication's send deadline fired: stamp, transmit unless the
    /// session is a quiet redundancy follower, re-arm.
    pub(crate) fn on_send_due(&mut self, ctx: &mut EngineCtx<'_>, id: u32, be_quiet: bool) {
        let topo = ctx.topo;
        let Some(element) = self.send.iter_mut().find(|e| e.id == id) else {
            return;
        };
        if be_quiet && !element.flags.redundant {
            trace!(
                com_id = element.com_id,
                red_id = element.red_id,
                "follower, send suppressed"
            );
        } else {
            wire::stamp_pd(&mut element.buf, element.seq, topo);
            match ctx
                .pool
                .send_udp(element.sock_idx, &element.buf, element.dest_ip, element.dest_port)
            {
                Ok(()) => {
                    element.seq = element.seq.wrapping_add(1);
                    element.num_rx_tx += 1;
                    ctx.stats.pd.tx += 1;
                    trace!(com_id = element.com_id, seq = element.seq, "sent PD");
                }
                Err(e) => {
                    // The entry stays armed; the next cycle retries.
                    warn!(com_id = element.com_id, error = %e, "PD send failed");
                }
            }
        }
        ctx.timers
            .schedule(TimerKey::PdSend(id), ctx.now + element.interval);
    }

    /// A subscription's supervision deadline fired: deliver one timeout
    /// event and latch until the next valid frame.
    pub(crate) fn on_timeout_due(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        id: u32,
        deliveries: &mut PdDeliveries,
    ) {
        let Some(element) = self.recv.iter_mut().find(|e| e.id == id) else {
            return;
        };
        if element.timed_out {
            return;
        }
        element.timed_out = true;
        ctx.stats.pd.timeouts += 1;
        if element.behavior == TimeoutBehavior::SetToZero {
            element.buf[..element.data_size].fill(0);
        }
        debug!(com_id = element.com_id, "subscription timed out");
        if let Some(callback) = &element.callback {
            deliveries.push((
                Arc::clone(callback),
                PdEvent {
                    info: PdInfo {
                        com_id: element.com_id,
                        src_ip: Ipv4Addr::UNSPECIFIED,
                        dest_ip: element.dest_ip,
                        topo: ctx.topo,
                        msg_type: MsgType::Pd,
                        seq: element.last_seq.unwrap_or(0),
                        user_ref: element.user_ref,
                        result: ResultCode::Timeout,
                    },
                    payload: Vec::new(),
                },
            ));
        }
        // The timer stays disarmed; the next valid receive re-arms it.
    }

    /// Dispatch one validated-or-not ingress frame.
    pub(crate) fn receive(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        frame: &[u8],
        src_ip: Ipv4Addr,
        deliveries: &mut PdDeliveries,
    ) {
        let view = match wire::validate_pd(frame, ctx.topo) {
            Ok(view) => view,
            Err(e) => {
                match &e {
                    TrdpError::Crc { .. } => ctx.stats.pd.crc_err += 1,
                    TrdpError::Topo { .. } => ctx.stats.pd.topo_err += 1,
                    _ => ctx.stats.pd.prot_err += 1,
                }
                debug!(error = %e, "dropped PD frame");
                return;
            }
        };
        if view.msg_type == MsgType::Pr {
            // Pull requests are recognized but not served.
            ctx.stats.pd.no_subs += 1;
            return;
        }

        let com_id = view.header.com_id();
        // Exact source match wins over wildcard subscriptions.
        let Some(pos) = self.best_match(com_id, src_ip) else {
            ctx.stats.pd.no_subs += 1;
            return;
        };

        let seq = view.header.seq();
        {
            let element = &mut self.recv[pos];
            if view.payload.len() > element.max_size {
                ctx.stats.pd.prot_err += 1;
                debug!(
                    com_id,
                    len = view.payload.len(),
                    max = element.max_size,
                    "PD payload exceeds subscription buffer"
                );
                return;
            }

            if let Some(last) = element.last_seq {
                let gap = seq.wrapping_sub(last);
                if gap > 1 {
                    element.num_missed += u64::from(gap - 1);
                    ctx.stats.pd.missed += u64::from(gap - 1);
                }
            }
            element.last_seq = Some(seq);

            element.timed_out = false;
            element.buf.clear();
            element.buf.extend_from_slice(view.payload);
            element.data_size = view.payload.len();
            element.got_data = true;
            element.num_rx_tx += 1;
            ctx.stats.pd.rx += 1;
            if !element.interval.is_zero() {
                ctx.timers
                    .schedule(TimerKey::PdTimeout(element.id), ctx.now + element.interval);
            }
        }

        let element = &self.recv[pos];
        if let Some(callback) = &element.callback {
            let payload = match self.inbound_payload(ctx, element, view.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(com_id, error = %e, "unmarshalling failed, dropping delivery");
                    return;
                }
            };
            deliveries.push((
                Arc::clone(callback),
                PdEvent {
                    info: PdInfo {
                        com_id,
                        src_ip,
                        dest_ip: element.dest_ip,
                        topo: view.header.topo(),
                        msg_type: view.msg_type,
                        seq,
                        user_ref: element.user_ref,
                        result: ResultCode::Ok,
                    },
                    payload,
                },
            ));
        }
    }

    /// Position of the best receive-table match for `(comId, srcIp)`:
    /// exact source filter first (either of the two), then wildcard.
    fn best_match(&self, com_id: u32, src_ip: Ipv4Addr) -> Option<usize> {
        let mut wildcard = None;
        for (pos, element) in self.recv.iter().enumerate() {
            if element.com_id != com_id {
                continue;
            }
            if element.src_ip == src_ip || element.src_ip2 == src_ip {
                return Some(pos);
            }
            if element.src_ip.is_unspecified() && wildcard.is_none() {
                wildcard = Some(pos);
            }
        }
        wildcard
    }

    /// Re-join every multicast group after a link bounce.
    pub(crate) fn reinit(&self, ctx: &mut EngineCtx<'_>, own_ip: Ipv4Addr) -> Result<()> {
        for element in &self.recv {
            if element.mc_group.is_some() {
                ctx.pool.rejoin_multicast(element.sock_idx, own_ip)?;
            }
        }
        Ok(())
    }

    /// Release everything, newest first.
    pub(crate) fn teardown(&mut self, ctx: &mut EngineCtx<'_>) {
        while let Some(element) = self.recv.pop() {
            ctx.timers.cancel(TimerKey::PdTimeout(element.id));
            let _ = ctx.pool.release(element.sock_idx, ctx.now, TimeVal::ZERO);
        }
        while let Some(element) = self.send.pop() {
            ctx.timers.cancel(TimerKey::PdSend(element.id));
            let _ = ctx.pool.release(element.sock_idx, ctx.now, TimeVal::ZERO);
        }
    }

    /// Publications and subscriptions currently registered.
    pub(crate) fn table_sizes(&self) -> (usize, usize) {
        (self.send.len(), self.recv.len())
    }

    /// Frames sent by one publication.
    pub(crate) fn pub_stats(&self, handle: PubHandle) -> Result<u64> {
        self.send
            .iter()
            .find(|e| e.id == handle.0)
            .map(|e| e.num_rx_tx)
            .ok_or(TrdpError::NoPublish)
    }

    /// Frames received and gaps seen by one subscription, as
    /// `(received, missed)`.
    pub(crate) fn sub_stats(&self, handle: SubHandle) -> Result<(u64, u64)> {
        self.recv
            .iter()
            .find(|e| e.id == handle.0)
            .map(|e| (e.num_rx_tx, e.num_missed))
            .ok_or(TrdpError::NoSubscribe)
    }

    /// Pick the least-loaded millisecond slot within the first cycle, so
    /// egress load stays uniform instead of bursting at open time.
    fn shaped_start(&self, now: TimeVal, interval: TimeVal) -> TimeVal {
        let slots = (interval.as_micros() / 1000).max(1) as usize;
        let mut load = vec![0u32; slots];
        for element in &self.send {
            let phase_us = element.interval.as_micros().max(1000);
            // Project this publication's sends into the new window.
            let mut t = 0u64;
            while t < slots as u64 * 1000 {
                let slot = (t / 1000) as usize % slots;
                load[slot] += 1;
                t += phase_us;
            }
        }
        let best = load
            .iter()
            .enumerate()
            .min_by_key(|&(_, &l)| l)
            .map(|(i, _)| i)
            .unwrap_or(0);
        now + TimeVal::from_millis(best as u64)
    }
}

fn mc_group(dest: Ipv4Addr) -> Option<Ipv4Addr> {
    dest.is_multicast().then_some(dest)
}
