//! Message data engine: request/reply/confirm transactions.
//!
//! Every transaction is identified by a 16-byte session id minted by the
//! caller and echoed by every reply, confirm and retransmission. The
//! engine keeps three tables: listeners (standing receive registrations
//! by ComId and optional URI), caller sessions (requests waiting for
//! replies) and replier sessions (received requests waiting for the
//! application's reply, then possibly for the caller's confirm).
//!
//! Ingress dispatch: notifications and requests search the listener
//! table; reply-kind messages search the caller table by
//! `(comId, sessionId)`; confirms search the replier table. Frames that
//! match nothing are counted and dropped, never surfaced.
//!
//! Transport is UDP or TCP per transaction. UDP replies return to the
//! request's source address; TCP replies use the connection the request
//! arrived on.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::BytesMut;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use uuid::timestamp::Timestamp;
use uuid::timestamp::context::ContextV1 as Context;

use crate::config::{MdConfig, PktFlags, SendParam};
use crate::error::{Result, ResultCode, TrdpError};
use crate::session::EngineCtx;
use crate::sock::SockKind;
use crate::time::TimeVal;
use crate::timers::TimerKey;
use crate::wire::{self, MAX_MD_DATA, MdFrameSpec, MsgType, URI_LEN};

/// Handle to a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenHandle(pub(crate) u32);

/// Transaction identity, as carried in the frame header.
pub type SessionId = [u8; 16];

/// Callback invoked for message data events, outside the session lock.
pub type MdCallback = dyn Fn(&MdEvent) + Send + Sync;

/// Metadata delivered with every message data event.
#[derive(Debug, Clone)]
pub struct MdInfo {
    /// Telegram identifier.
    pub com_id: u32,
    /// Peer address (zero on pure timeout events).
    pub src_ip: Ipv4Addr,
    /// Sequence counter of the frame.
    pub seq: u32,
    /// Message type that triggered the event. `Mq` means the
    /// application owes a confirm for this session.
    pub msg_type: MsgType,
    /// Transaction identity.
    pub session_id: SessionId,
    /// Application status carried by replies.
    pub reply_status: u32,
    /// Replies received so far in this transaction.
    pub num_replies: u32,
    /// Replies that demanded a confirm (`Mq`) so far.
    pub num_replies_query: u32,
    /// Confirms already sent in this transaction.
    pub num_confirm_sent: u32,
    /// Retransmissions performed so far.
    pub num_retries: u32,
    /// Source URI of the frame.
    pub source_uri: String,
    /// Destination URI of the frame.
    pub destination_uri: String,
    /// Token supplied at listen/request time.
    pub user_ref: usize,
    /// Outcome the event reports.
    pub result: ResultCode,
}

/// A message data event: metadata plus payload.
#[derive(Debug, Clone)]
pub struct MdEvent {
    /// Event metadata.
    pub info: MdInfo,
    /// Payload bytes (empty on timeout events).
    pub payload: Vec<u8>,
}

/// Deferred deliveries collected under the lock, fired after it.
pub(crate) type MdDeliveries = Vec<(Arc<MdCallback>, MdEvent)>;

/// Parameters for [`crate::session::Session::add_listener`].
#[derive(Clone, Default)]
pub struct ListenSpec {
    /// ComId to listen for, non-zero.
    pub com_id: u32,
    /// Only accept frames whose destination URI equals this one.
    pub uri: Option<String>,
    /// Flags; `None` inherits the session default. The `tcp` flag
    /// selects the TCP listener.
    pub flags: Option<PktFlags>,
    /// Token handed back in every event.
    pub user_ref: usize,
    /// Callback; `None` inherits the session default.
    pub callback: Option<Arc<MdCallback>>,
}

impl std::fmt::Debug for ListenSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenSpec")
            .field("com_id", &self.com_id)
            .field("uri", &self.uri)
            .field("flags", &self.flags)
            .field("user_ref", &self.user_ref)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Parameters for notify and request calls.
#[derive(Clone)]
pub struct RequestSpec {
    /// Telegram identifier, non-zero.
    pub com_id: u32,
    /// Peer address, non-zero.
    pub dest_ip: Ipv4Addr,
    /// Peer port; zero inherits the session's MD port.
    pub dest_port: u16,
    /// Logical source address.
    pub source_uri: String,
    /// Logical destination address.
    pub destination_uri: String,
    /// Flags; `None` inherits the session default.
    pub flags: Option<PktFlags>,
    /// QoS/TTL; `None` inherits the session default.
    pub send_param: Option<SendParam>,
    /// Supervision interval for the first reply; zero inherits the
    /// session default. Ignored for notifications.
    pub reply_timeout: TimeVal,
    /// Expected repliers: 0 = unknown/many, 1 = exactly one, n = up to
    /// `n`. Ignored for notifications.
    pub num_repliers: u32,
    /// Retransmission budget; `None` inherits the session default.
    pub num_retries_max: Option<u32>,
    /// Token handed back in every event.
    pub user_ref: usize,
    /// Callback; `None` inherits the session default.
    pub callback: Option<Arc<MdCallback>>,
    /// Payload.
    pub data: Vec<u8>,
}

impl Default for RequestSpec {
    fn default() -> Self {
        Self {
            com_id: 0,
            dest_ip: Ipv4Addr::UNSPECIFIED,
            dest_port: 0,
            source_uri: String::new(),
            destination_uri: String::new(),
            flags: None,
            send_param: None,
            reply_timeout: TimeVal::default(),
            num_repliers: 0,
            num_retries_max: None,
            user_ref: 0,
            callback: None,
            data: Vec::new(),
        }
    }
}

impl std::fmt::Debug for RequestSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSpec")
            .field("com_id", &self.com_id)
            .field("dest_ip", &self.dest_ip)
            .field("dest_port", &self.dest_port)
            .field("source_uri", &self.source_uri)
            .field("destination_uri", &self.destination_uri)
            .field("flags", &self.flags)
            .field("send_param", &self.send_param)
            .field("reply_timeout", &self.reply_timeout)
            .field("num_repliers", &self.num_repliers)
            .field("num_retries_max", &self.num_retries_max)
            .field("user_ref", &self.user_ref)
            .field("callback", &self.callback.is_some())
            .field("data", &self.data)
            .finish()
    }
}

struct Listener {
    id: u32,
    com_id: u32,
    uri: Option<String>,
    flags: PktFlags,
    user_ref: usize,
    callback: Option<Arc<MdCallback>>,
    sock_idx: usize,
}

struct CallerSession {
    id: u32,
    session_id: SessionId,
    com_id: u32,
    dest_ip: Ipv4Addr,
    dest_port: u16,
    flags: PktFlags,
    source_uri: [u8; URI_LEN],
    destination_uri: [u8; URI_LEN],
    frame: BytesMut,
    seq: u32,
    reply_timeout: TimeVal,
    num_repliers: u32,
    num_replies: u32,
    num_replies_query: u32,
    num_confirm_sent: u32,
    num_retries: u32,
    num_retries_max: u32,
    disable_reply_rx: bool,
    confirms_pending: u32,
    sock_idx: usize,
    user_ref: usize,
    callback: Option<Arc<MdCallback>>,
    _charge: crate::mem::MemCharge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplierState {
    /// Request delivered, waiting for the application's reply call.
    WaitAppReply,
    /// `Mq` sent, waiting for the caller's confirm.
    WaitConfirm,
}

struct ReplierSession {
    id: u32,
    session_id: SessionId,
    com_id: u32,
    caller: SocketAddrV4,
    flags: PktFlags,
    state: ReplierState,
    caller_uri: [u8; URI_LEN],
    own_uri: [u8; URI_LEN],
    sock_idx: usize,
    user_ref: usize,
    callback: Option<Arc<MdCallback>>,
}

/// The MD engine of one session.
pub(crate) struct MdEngine {
    listeners: Vec<Listener>,
    callers: Vec<CallerSession>,
    repliers: Vec<ReplierSession>,
    next_id: u32,
    clock: Context,
}

impl Default for MdEngine {
    fn default() -> Self {
        MdEngine {
            listeners: Vec::new(),
            callers: Vec::new(),
            repliers: Vec::new(),
            next_id: 0,
            clock: Context::new(0),
        }
    }
}

impl MdEngine {
    fn fresh_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Mint a transaction identity: time-ordered head, own-address tail.
    fn new_session_id(&self, own_ip: Ipv4Addr) -> SessionId {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        let octets = own_ip.octets();
        // Locally administered node id derived from the own address.
        let node = [0x02, 0x18, octets[0], octets[1], octets[2], octets[3]];
        let ts = Timestamp::from_unix(&self.clock, now.as_secs(), now.subsec_nanos());
        Uuid::new_v1(ts, &node).into_bytes()
    }

    /// Register a listener for incoming notifications and requests.
    pub(crate) fn add_listener(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        spec: &ListenSpec,
        defaults: &MdConfig,
        own_ip: Ipv4Addr,
    ) -> Result<ListenHandle> {
        if spec.com_id == 0 {
            return Err(TrdpError::param("comId must be non-zero"));
        }
        let flags = spec.flags.unwrap_or(defaults.flags);
        let sock_idx = if flags.tcp {
            ctx.pool.request_tcp_listener(own_ip, defaults.tcp_port)?
        } else {
            ctx.pool
                .request_udp(SockKind::MdUdp, own_ip, defaults.udp_port, defaults.send_param)?
        };
        let id = self.fresh_id();
        self.listeners.push(Listener {
            id,
            com_id: spec.com_id,
            uri: spec.uri.clone(),
            flags,
            user_ref: spec.user_ref,
            callback: spec.callback.clone().or_else(|| defaults.callback.clone()),
            sock_idx,
        });
        debug!(com_id = spec.com_id, tcp = flags.tcp, "listener added");
        Ok(ListenHandle(id))
    }

    /// Remove a listener. In-flight replier sessions created by it run
    /// to completion on their own socket references.
    pub(crate) fn remove_listener(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        handle: ListenHandle,
    ) -> Result<()> {
        let pos = self
            .listeners
            .iter()
            .position(|l| l.id == handle.0)
            .ok_or(TrdpError::NoListener)?;
        let listener = self.listeners.remove(pos);
        ctx.pool.release(listener.sock_idx, ctx.now, TimeVal::ZERO)?;
        Ok(())
    }

    /// Send a notification (`Mn`). Fire-and-forget: no session is
    /// retained.
    pub(crate) fn notify(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        spec: &RequestSpec,
        defaults: &MdConfig,
        own_ip: Ipv4Addr,
    ) -> Result<()> {
        let prepared = self.prepare_outgoing(ctx, spec, defaults, own_ip, MsgType::Mn, 0)?;
        let tcp = prepared.flags.tcp;
        self.transmit(ctx, &prepared)?;
        ctx.stats.md_mut(tcp).tx += 1;
        ctx.release_socket(prepared.sock_idx, defaults.connect_timeout)?;
        Ok(())
    }

    /// Send a request (`Mr`) and open a caller session supervising the
    /// replies.
    pub(crate) fn request(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        spec: &RequestSpec,
        defaults: &MdConfig,
        own_ip: Ipv4Addr,
    ) -> Result<SessionId> {
        let reply_timeout = if spec.reply_timeout.is_zero() {
            defaults.reply_timeout
        } else {
            spec.reply_timeout
        };
        let prepared = self.prepare_outgoing(
            ctx,
            spec,
            defaults,
            own_ip,
            MsgType::Mr,
            reply_timeout.as_micros() as u32,
        )?;
        self.transmit(ctx, &prepared)?;
        ctx.stats.md_mut(prepared.flags.tcp).tx += 1;

        let charge = ctx.mem.alloc(prepared.frame.len())?;
        let id = self.fresh_id();
        let session_id = prepared.session_id;
        ctx.timers
            .schedule(TimerKey::MdReply(id), ctx.now + reply_timeout);
        self.callers.push(CallerSession {
            id,
            session_id,
            com_id: spec.com_id,
            dest_ip: prepared.dest_ip,
            dest_port: prepared.dest_port,
            flags: prepared.flags,
            source_uri: wire::encode_uri(&spec.source_uri)?,
            destination_uri: wire::encode_uri(&spec.destination_uri)?,
            frame: prepared.frame,
            seq: 0,
            reply_timeout,
            num_repliers: spec.num_repliers,
            num_replies: 0,
            num_replies_query: 0,
            num_confirm_sent: 0,
            num_retries: 0,
            num_retries_max: spec.num_retries_max.unwrap_or(defaults.num_retries_max),
            disable_reply_rx: false,
            confirms_pending: 0,
            sock_idx: prepared.sock_idx,
            user_ref: spec.user_ref,
            callback: spec.callback.clone().or_else(|| defaults.callback.clone()),
            _charge: charge,
        });
        debug!(com_id = spec.com_id, session = ?Uuid::from_bytes(session_id), "request sent");
        Ok(session_id)
    }

    /// Answer a pending request. `confirm` asks the caller for an
    /// explicit confirmation (`Mq` instead of `Mp`).
    pub(crate) fn reply(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        session_id: &SessionId,
        user_status: u32,
        confirm: bool,
        data: &[u8],
        defaults: &MdConfig,
    ) -> Result<()> {
        let msg_type = if confirm { MsgType::Mq } else { MsgType::Mp };
        self.replier_send(ctx, session_id, msg_type, user_status, data, defaults)
    }

    /// Answer a pending request with an error (`Me`).
    pub(crate) fn reply_error(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        session_id: &SessionId,
        user_status: u32,
        defaults: &MdConfig,
    ) -> Result<()> {
        self.replier_send(ctx, session_id, MsgType::Me, user_status, &[], defaults)
    }

    fn replier_send(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        session_id: &SessionId,
        msg_type: MsgType,
        user_status: u32,
        data: &[u8],
        defaults: &MdConfig,
    ) -> Result<()> {
        if data.len() > MAX_MD_DATA {
            return Err(TrdpError::param(format!(
                "payload {} exceeds MD maximum {MAX_MD_DATA}",
                data.len()
            )));
        }
        let pos = self
            .repliers
            .iter()
            .position(|r| {
                r.session_id == *session_id && r.state == ReplierState::WaitAppReply
            })
            .ok_or(TrdpError::NoListener)?;

        let (frame, tcp) = {
            let replier = &self.repliers[pos];
            let confirm_timeout_us = defaults.confirm_timeout.as_micros() as u32;
            let frame = wire::build_md(
                &MdFrameSpec {
                    msg_type,
                    com_id: replier.com_id,
                    topo: ctx.topo,
                    reply_status: user_status,
                    session_id: *session_id,
                    reply_timeout_us: if msg_type == MsgType::Mq {
                        confirm_timeout_us
                    } else {
                        0
                    },
                    source_uri: replier.own_uri,
                    destination_uri: replier.caller_uri,
                },
                0,
                data,
            );
            (frame, replier.flags.tcp)
        };

        {
            let replier = &self.repliers[pos];
            if tcp {
                ctx.pool.tcp_send(replier.sock_idx, frame)?;
            } else {
                ctx.pool.send_udp(
                    replier.sock_idx,
                    &frame,
                    *replier.caller.ip(),
                    replier.caller.port(),
                )?;
            }
        }
        ctx.stats.md_mut(tcp).tx += 1;

        if msg_type == MsgType::Mq {
            let replier = &mut self.repliers[pos];
            replier.state = ReplierState::WaitConfirm;
            let id = replier.id;
            ctx.timers
                .schedule(TimerKey::MdConfirm(id), ctx.now + defaults.confirm_timeout);
        } else {
            let replier = self.repliers.remove(pos);
            ctx.release_socket(replier.sock_idx, defaults.connect_timeout)?;
        }
        Ok(())
    }

    /// Confirm a reply that demanded one (`Mc`), caller side.
    pub(crate) fn confirm(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        session_id: &SessionId,
        user_status: u32,
        defaults: &MdConfig,
    ) -> Result<()> {
        let pos = self
            .callers
            .iter()
            .position(|c| c.session_id == *session_id)
            .ok_or_else(|| TrdpError::param("no caller session for confirm"))?;
        if self.callers[pos].confirms_pending == 0 {
            return Err(TrdpError::param("no confirm owed for this session"));
        }

        let (frame, tcp) = {
            let caller = &self.callers[pos];
            let frame = wire::build_md(
                &MdFrameSpec {
                    msg_type: MsgType::Mc,
                    com_id: caller.com_id,
                    topo: ctx.topo,
                    reply_status: user_status,
                    session_id: *session_id,
                    reply_timeout_us: 0,
                    source_uri: caller.source_uri,
                    destination_uri: caller.destination_uri,
                },
                0,
                &[],
            );
            (frame, caller.flags.tcp)
        };

        {
            let caller = &self.callers[pos];
            if tcp {
                ctx.pool.tcp_send(caller.sock_idx, frame)?;
            } else {
                ctx.pool
                    .send_udp(caller.sock_idx, &frame, caller.dest_ip, caller.dest_port)?;
            }
        }
        ctx.stats.md_mut(tcp).tx += 1;

        let caller = &mut self.callers[pos];
        caller.confirms_pending -= 1;
        caller.num_confirm_sent += 1;
        self.maybe_finish_caller(ctx, pos, defaults);
        Ok(())
    }

    /// Close a caller session whose work is done: expected replies in,
    /// no confirm owed.
    fn maybe_finish_caller(&mut self, ctx: &mut EngineCtx<'_>, pos: usize, defaults: &MdConfig) {
        let caller = &self.callers[pos];
        if caller.disable_reply_rx && caller.confirms_pending == 0 {
            let caller = self.callers.remove(pos);
            ctx.timers.cancel(TimerKey::MdReply(caller.id));
            let _ = ctx.release_socket(caller.sock_idx, defaults.connect_timeout);
            trace!(session = ?Uuid::from_bytes(caller.session_id), "caller session closed");
        }
    }

    fn prepare_outgoing(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        spec: &RequestSpec,
        defaults: &MdConfig,
        own_ip: Ipv4Addr,
        msg_type: MsgType,
        reply_timeout_us: u32,
    ) -> Result<PreparedOutgoing> {
        if spec.com_id == 0 {
            return Err(TrdpError::param("comId must be non-zero"));
        }
        if spec.dest_ip.is_unspecified() {
            return Err(TrdpError::param("destination address must be set"));
        }
        if spec.data.len() > MAX_MD_DATA {
            return Err(TrdpError::param(format!(
                "payload {} exceeds MD maximum {MAX_MD_DATA}",
                spec.data.len()
            )));
        }
        let flags = spec.flags.unwrap_or(defaults.flags);
        let send_param = spec.send_param.unwrap_or(defaults.send_param);
        let dest_port = if spec.dest_port != 0 {
            spec.dest_port
        } else if flags.tcp {
            defaults.tcp_port
        } else {
            defaults.udp_port
        };

        let sock_idx = if flags.tcp {
            ctx.pool.connect_tcp(spec.dest_ip, dest_port, send_param)?
        } else {
            // Egress binds an ephemeral port; replies come back to it.
            ctx.pool
                .request_udp(SockKind::MdUdp, own_ip, 0, send_param)?
        };

        let session_id = self.new_session_id(own_ip);
        let frame = wire::build_md(
            &MdFrameSpec {
                msg_type,
                com_id: spec.com_id,
                topo: ctx.topo,
                reply_status: 0,
                session_id,
                reply_timeout_us,
                source_uri: wire::encode_uri(&spec.source_uri)?,
                destination_uri: wire::encode_uri(&spec.destination_uri)?,
            },
            0,
            &spec.data,
        );
        Ok(PreparedOutgoing {
            frame,
            session_id,
            sock_idx,
            dest_ip: spec.dest_ip,
            dest_port,
            flags,
        })
    }

    fn transmit(&self, ctx: &mut EngineCtx<'_>, prepared: &PreparedOutgoing) -> Result<()> {
        if prepared.flags.tcp {
            ctx.pool.tcp_send(prepared.sock_idx, prepared.frame.clone())
        } else {
            ctx.pool.send_udp(
                prepared.sock_idx,
                &prepared.frame,
                prepared.dest_ip,
                prepared.dest_port,
            )
        }
    }

    /// Dispatch one ingress MD frame.
    pub(crate) fn ingress(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        frame: &[u8],
        src: SocketAddrV4,
        sock_idx: usize,
        tcp: bool,
        defaults: &MdConfig,
        deliveries: &mut MdDeliveries,
    ) {
        let view = match wire::validate_md(frame, ctx.topo) {
            Ok(view) => view,
            Err(e) => {
                let stats = ctx.stats.md_mut(tcp);
                match &e {
                    TrdpError::Crc { .. } => stats.crc_err += 1,
                    TrdpError::Topo { .. } => stats.topo_err += 1,
                    _ => stats.prot_err += 1,
                }
                debug!(error = %e, "dropped MD frame");
                return;
            }
        };
        ctx.stats.md_mut(tcp).rx += 1;

        match view.msg_type {
            MsgType::Mn | MsgType::Mr => {
                self.ingress_to_listener(ctx, &view, src, sock_idx, tcp, deliveries)
            }
            MsgType::Mp | MsgType::Mq | MsgType::Me => {
                self.ingress_to_caller(ctx, &view, src, tcp, defaults, deliveries)
            }
            MsgType::Mc => self.ingress_confirm(ctx, &view, src, tcp, defaults, deliveries),
            _ => unreachable!("validate_md admits MD types only"),
        }
    }

    fn ingress_to_listener(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        view: &wire::MdView<'_>,
        src: SocketAddrV4,
        sock_idx: usize,
        tcp: bool,
        deliveries: &mut MdDeliveries,
    ) {
        let com_id = view.header.com_id();
        let dest_uri = view.header.destination_uri();
        let listener = self.listeners.iter().find(|l| {
            l.com_id == com_id
                && l.flags.tcp == tcp
                && l.uri.as_deref().is_none_or(|u| u == dest_uri)
        });
        let Some(listener) = listener else {
            ctx.stats.md_mut(tcp).no_listener += 1;
            debug!(com_id, "no listener for MD frame");
            return;
        };
        let flags = listener.flags;
        let user_ref = listener.user_ref;
        let callback = listener.callback.clone();

        if view.msg_type == MsgType::Mr {
            // The reply travels on the socket the request arrived on.
            if ctx.pool.retain(sock_idx).is_err() {
                warn!(com_id, "request arrived on a vanished socket");
                return;
            }
            let id = self.fresh_id();
            self.repliers.push(ReplierSession {
                id,
                session_id: view.header.session_id,
                com_id,
                caller: src,
                flags,
                state: ReplierState::WaitAppReply,
                caller_uri: view.header.source_uri,
                own_uri: view.header.destination_uri,
                sock_idx,
                user_ref,
                callback: callback.clone(),
            });
        }

        if let Some(callback) = callback {
            deliveries.push((
                callback,
                MdEvent {
                    info: info_from_view(view, src, user_ref, ResultCode::Ok),
                    payload: view.payload.to_vec(),
                },
            ));
        }
    }

    fn ingress_to_caller(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        view: &wire::MdView<'_>,
        src: SocketAddrV4,
        tcp: bool,
        defaults: &MdConfig,
        deliveries: &mut MdDeliveries,
    ) {
        let com_id = view.header.com_id();
        let session_id = view.header.session_id;
        let Some(pos) = self
            .callers
            .iter()
            .position(|c| c.com_id == com_id && c.session_id == session_id)
        else {
            ctx.stats.md_mut(tcp).no_listener += 1;
            debug!(com_id, "reply matches no caller session");
            return;
        };
        if self.callers[pos].disable_reply_rx {
            // Late reply after the expected count was met: de-dupe
            // guard, dropped without counting.
            trace!(com_id, "reply after disable_reply_rx");
            return;
        }

        {
            let caller = &mut self.callers[pos];
            caller.num_replies += 1;
            if view.msg_type == MsgType::Mq {
                caller.num_replies_query += 1;
                caller.confirms_pending += 1;
            }
            match caller.num_repliers {
                0 => {} // unknown: the reply deadline ends the session
                1 => caller.disable_reply_rx = true,
                n => {
                    if caller.num_replies >= n {
                        caller.disable_reply_rx = true;
                    }
                }
            }
        }

        let caller = &self.callers[pos];
        if let Some(callback) = &caller.callback {
            let mut info = info_from_view(view, src, caller.user_ref, ResultCode::Ok);
            info.num_replies = caller.num_replies;
            info.num_replies_query = caller.num_replies_query;
            info.num_confirm_sent = caller.num_confirm_sent;
            info.num_retries = caller.num_retries;
            deliveries.push((
                Arc::clone(callback),
                MdEvent {
                    info,
                    payload: view.payload.to_vec(),
                },
            ));
        }
        self.maybe_finish_caller(ctx, pos, defaults);
    }

    fn ingress_confirm(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        view: &wire::MdView<'_>,
        src: SocketAddrV4,
        tcp: bool,
        defaults: &MdConfig,
        deliveries: &mut MdDeliveries,
    ) {
        let session_id = view.header.session_id;
        let Some(pos) = self.repliers.iter().position(|r| {
            r.session_id == session_id && r.state == ReplierState::WaitConfirm
        }) else {
            ctx.stats.md_mut(tcp).no_listener += 1;
            debug!("confirm matches no replier session");
            return;
        };
        let replier = self.repliers.remove(pos);
        ctx.timers.cancel(TimerKey::MdConfirm(replier.id));
        let _ = ctx.release_socket(replier.sock_idx, defaults.connect_timeout);
        if let Some(callback) = &replier.callback {
            deliveries.push((
                Arc::clone(callback),
                MdEvent {
                    info: info_from_view(view, src, replier.user_ref, ResultCode::Ok),
                    payload: Vec::new(),
                },
            ));
        }
        trace!(com_id = replier.com_id, "replier session confirmed");
    }

    /// A caller session's reply deadline fired: retry with the same
    /// session id while the budget lasts, then report.
    pub(crate) fn on_reply_deadline(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        id: u32,
        defaults: &MdConfig,
        deliveries: &mut MdDeliveries,
    ) {
        let Some(pos) = self.callers.iter().position(|c| c.id == id) else {
            return;
        };

        let retry = {
            let caller = &self.callers[pos];
            caller.num_replies == 0 && caller.num_retries < caller.num_retries_max
        };
        if retry {
            let caller = &mut self.callers[pos];
            caller.num_retries += 1;
            caller.seq = caller.seq.wrapping_add(1);
            wire::stamp_md_retry(&mut caller.frame, caller.seq);
            let send = if caller.flags.tcp {
                ctx.pool.tcp_send(caller.sock_idx, caller.frame.clone())
            } else {
                ctx.pool
                    .send_udp(caller.sock_idx, &caller.frame, caller.dest_ip, caller.dest_port)
            };
            match send {
                Ok(()) => {
                    ctx.stats.md_mut(caller.flags.tcp).tx += 1;
                    debug!(
                        com_id = caller.com_id,
                        retry = caller.num_retries,
                        "request retransmitted"
                    );
                }
                Err(e) => warn!(com_id = caller.com_id, error = %e, "retransmit failed"),
            }
            let deadline = ctx.now + caller.reply_timeout;
            ctx.timers.schedule(TimerKey::MdReply(id), deadline);
            return;
        }

        let caller = self.callers.remove(pos);
        let tcp = caller.flags.tcp;
        let _ = ctx.release_socket(caller.sock_idx, defaults.connect_timeout);
        if caller.num_replies == 0 || caller.num_repliers == 0 {
            // Zero replies is a failure; for an unknown replier count
            // the deadline is the regular end of the transaction and is
            // reported the same way.
            ctx.stats.md_mut(tcp).reply_timeouts += 1;
            if let Some(callback) = &caller.callback {
                deliveries.push((
                    Arc::clone(callback),
                    MdEvent {
                        info: MdInfo {
                            com_id: caller.com_id,
                            src_ip: Ipv4Addr::UNSPECIFIED,
                            seq: caller.seq,
                            msg_type: MsgType::Mr,
                            session_id: caller.session_id,
                            reply_status: 0,
                            num_replies: caller.num_replies,
                            num_replies_query: caller.num_replies_query,
                            num_confirm_sent: caller.num_confirm_sent,
                            num_retries: caller.num_retries,
                            source_uri: String::new(),
                            destination_uri: String::new(),
                            user_ref: caller.user_ref,
                            result: ResultCode::Timeout,
                        },
                        payload: Vec::new(),
                    },
                ));
            }
        }
    }

    /// A replier session's confirm deadline fired.
    pub(crate) fn on_confirm_deadline(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        id: u32,
        defaults: &MdConfig,
        deliveries: &mut MdDeliveries,
    ) {
        let Some(pos) = self.repliers.iter().position(|r| r.id == id) else {
            return;
        };
        let replier = self.repliers.remove(pos);
        let tcp = replier.flags.tcp;
        ctx.stats.md_mut(tcp).confirm_timeouts += 1;
        let _ = ctx.release_socket(replier.sock_idx, defaults.connect_timeout);
        debug!(com_id = replier.com_id, "confirm timed out");
        if let Some(callback) = &replier.callback {
            deliveries.push((
                Arc::clone(callback),
                MdEvent {
                    info: MdInfo {
                        com_id: replier.com_id,
                        src_ip: *replier.caller.ip(),
                        seq: 0,
                        msg_type: MsgType::Mq,
                        session_id: replier.session_id,
                        reply_status: 0,
                        num_replies: 0,
                        num_replies_query: 0,
                        num_confirm_sent: 0,
                        num_retries: 0,
                        source_uri: String::new(),
                        destination_uri: String::new(),
                        user_ref: replier.user_ref,
                        result: ResultCode::ConfirmTimeout,
                    },
                    payload: Vec::new(),
                },
            ));
        }
    }

    /// Release everything, newest first.
    pub(crate) fn teardown(&mut self, ctx: &mut EngineCtx<'_>) {
        while let Some(replier) = self.repliers.pop() {
            ctx.timers.cancel(TimerKey::MdConfirm(replier.id));
            let _ = ctx.pool.release(replier.sock_idx, ctx.now, TimeVal::ZERO);
        }
        while let Some(caller) = self.callers.pop() {
            ctx.timers.cancel(TimerKey::MdReply(caller.id));
            let _ = ctx.pool.release(caller.sock_idx, ctx.now, TimeVal::ZERO);
        }
        while let Some(listener) = self.listeners.pop() {
            let _ = ctx.pool.release(listener.sock_idx, ctx.now, TimeVal::ZERO);
        }
    }

    /// Listener, caller and replier table sizes.
    pub(crate) fn table_sizes(&self) -> (usize, usize, usize) {
        (self.listeners.len(), self.callers.len(), self.repliers.len())
    }
}

struct PreparedOutgoing {
    frame: BytesMut,
    session_id: SessionId,
    sock_idx: usize,
    dest_ip: Ipv4Addr,
    dest_port: u16,
    flags: PktFlags,
}

fn info_from_view(
    view: &wire::MdView<'_>,
    src: SocketAddrV4,
    user_ref: usize,
    result: ResultCode,
) -> MdInfo {
    MdInfo {
        com_id: view.header.com_id(),
        src_ip: *src.ip(),
        seq: view.header.seq(),
        msg_type: view.msg_type,
        session_id: view.header.session_id,
        reply_status: view.header.reply_status.get(),
        num_replies: 0,
        num_replies_query: 0,
        num_confirm_sent: 0,
        num_retries: 0,
        source_uri: view.header.source_uri().to_string(),
        destination_uri: view.header.destination_uri().to_string(),
        user_ref,
        result,
    }
}
