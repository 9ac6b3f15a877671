//! Session façade and registry.
//!
//! A [`Registry`] owns the process-wide pieces, the telegram memory
//! ledger and the list of open sessions, and hands out [`Session`]
//! handles. A session bundles the socket pool, the deadline index, both
//! engines and the statistics block behind one mutex; every public
//! operation locks it for its full duration.
//!
//! Callbacks are never invoked with the lock held: the engines push
//! deliveries onto drain lists and [`Session::process`] fires them after
//! unlocking, so a callback may call straight back into the session
//! (unsubscribing from inside a receive callback is legal).
//!
//! The integration model is select/poll driven and caller-owned:
//! [`Session::get_interval`] yields the time budget and the descriptors
//! of interest, the application waits (or uses the bundled
//! [`Session::wait_for_event`]), then calls [`Session::process`] with
//! whatever became ready.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info, warn};

use crate::config::{MdConfig, PdConfig, ProcessConfig, SessionConfig};
use crate::error::{Result, TrdpError};
use crate::marshall::Marshalling;
use crate::md::{
    ListenHandle, ListenSpec, MdDeliveries, MdEngine, RequestSpec, SessionId,
};
use crate::mem::{MemConfig, MemPool};
use crate::pd::{
    PdDeliveries, PdEngine, PdInfo, PubHandle, PublishSpec, SubHandle, SubscribeSpec,
};
use crate::sock::{SockKind, SocketPool};
use crate::stats::SessionStats;
use crate::time::TimeVal;
use crate::timers::{DeadlineIndex, TimerKey};

/// Fallback poll interval when no deadline is armed.
pub const DEFAULT_POLL_INTERVAL: TimeVal = TimeVal::from_micros(10_000);

/// Everything an engine operation needs besides its own tables.
///
/// Built from disjoint `SessionInner` fields for the duration of one
/// locked operation.
pub(crate) struct EngineCtx<'a> {
    pub pool: &'a mut SocketPool,
    pub timers: &'a mut DeadlineIndex,
    pub mem: &'a Arc<MemPool>,
    pub marshalling: Option<&'a Marshalling>,
    pub stats: &'a mut SessionStats,
    pub topo: (u32, u32),
    pub now: TimeVal,
}

impl EngineCtx<'_> {
    /// Drop a socket reference and arm the idle reaper when the pool
    /// keeps the entry around (TCP).
    pub(crate) fn release_socket(&mut self, idx: usize, connect_timeout: TimeVal) -> Result<()> {
        if let Some(deadline) = self.pool.release(idx, self.now, connect_timeout)? {
            self.timers.schedule(TimerKey::SockIdle(idx as u32), deadline);
        }
        Ok(())
    }
}

/// Process-wide context sessions are opened against.
///
/// The reference implementation keeps a module-global session list; here
/// the registry is an explicit object and its lock is the process-wide
/// lock.
pub struct Registry {
    mem: Arc<MemPool>,
    sessions: Mutex<Vec<Weak<SessionShared>>>,
}

impl Registry {
    /// Set up the registry and the shared telegram memory ledger.
    pub fn new(mem_config: MemConfig) -> Result<Self> {
        Ok(Registry {
            mem: MemPool::new(&mem_config)?,
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Open a session. `marshalling` supplies the dataset tables used by
    /// telegrams carrying the marshall flag.
    pub fn open_session(
        &self,
        config: SessionConfig,
        marshalling: Option<Marshalling>,
    ) -> Result<Session> {
        let now = TimeVal::now();
        let shared = Arc::new(SessionShared {
            inner: Mutex::new(SessionInner {
                own_ip: config.own_ip,
                leader_ip: config.leader_ip,
                topo: (0, 0),
                pd_cfg: config.pd,
                md_cfg: config.md,
                proc_cfg: config.process,
                marshalling: marshalling.map(Arc::new),
                mem: Arc::clone(&self.mem),
                pool: SocketPool::new(),
                timers: DeadlineIndex::new(),
                pd: PdEngine::default(),
                md: MdEngine::default(),
                stats: SessionStats {
                    since: now,
                    ..SessionStats::default()
                },
                red_id: 0,
                be_quiet: false,
                closed: false,
                rx_buf: vec![0; 65536],
            }),
        });

        let mut sessions = lock_ignore_poison(&self.sessions);
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.push(Arc::downgrade(&shared));
        info!(own_ip = %config.own_ip, "session opened");
        Ok(Session { shared })
    }

    /// Number of sessions still open.
    pub fn session_count(&self) -> usize {
        let mut sessions = lock_ignore_poison(&self.sessions);
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.len()
    }

    /// Bytes currently charged to the telegram ledger.
    pub fn mem_used(&self) -> usize {
        self.mem.used()
    }
}

struct SessionShared {
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    own_ip: Ipv4Addr,
    leader_ip: Ipv4Addr,
    topo: (u32, u32),
    pd_cfg: PdConfig,
    md_cfg: MdConfig,
    proc_cfg: ProcessConfig,
    marshalling: Option<Arc<Marshalling>>,
    mem: Arc<MemPool>,
    pool: SocketPool,
    timers: DeadlineIndex,
    pd: PdEngine,
    md: MdEngine,
    stats: SessionStats,
    red_id: u32,
    be_quiet: bool,
    closed: bool,
    rx_buf: Vec<u8>,
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

macro_rules! ctx {
    ($inner:expr, $now:expr) => {{
        EngineCtx {
            pool: &mut $inner.pool,
            timers: &mut $inner.timers,
            mem: &$inner.mem,
            marshalling: $inner.marshalling.as_deref(),
            stats: &mut $inner.stats,
            topo: $inner.topo,
            now: $now,
        }
    }};
}

/// Handle to an open session. Clones share the session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    fn lock(&self) -> Result<MutexGuard<'_, SessionInner>> {
        let guard = lock_ignore_poison(&self.shared.inner);
        if guard.closed {
            return Err(TrdpError::NoInit);
        }
        Ok(guard)
    }

    /// The crate version, for diagnostics.
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Close the session, releasing every registered telegram, listener
    /// and socket in reverse registration order.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let mut ctx = ctx!(inner, now);
        inner.md.teardown(&mut ctx);
        inner.pd.teardown(&mut ctx);
        inner.closed = true;
        info!(own_ip = %inner.own_ip, "session closed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Process data
    // ------------------------------------------------------------------

    /// Register a cyclic publication; the first frame goes out one
    /// interval from now (or at its shaped offset).
    pub fn publish(&self, spec: &PublishSpec) -> Result<PubHandle> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let traffic_shaping = inner.proc_cfg.traffic_shaping;
        let own_ip = inner.own_ip;
        let pd_cfg = inner.pd_cfg.clone();
        let mut ctx = ctx!(inner, now);
        inner.pd.publish(&mut ctx, spec, &pd_cfg, own_ip, traffic_shaping)
    }

    /// Withdraw a publication.
    pub fn unpublish(&self, handle: PubHandle) -> Result<()> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let mut ctx = ctx!(inner, now);
        inner.pd.unpublish(&mut ctx, handle)
    }

    /// Update a publication's payload; it is sent with the next cycle.
    pub fn put(&self, handle: PubHandle, data: &[u8]) -> Result<()> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let mut ctx = ctx!(inner, now);
        inner.pd.put(&mut ctx, handle, data)
    }

    /// Register a subscription with deadline supervision.
    pub fn subscribe(&self, spec: &SubscribeSpec) -> Result<SubHandle> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let own_ip = inner.own_ip;
        let pd_cfg = inner.pd_cfg.clone();
        let mut ctx = ctx!(inner, now);
        inner.pd.subscribe(&mut ctx, spec, &pd_cfg, own_ip)
    }

    /// Withdraw a subscription from the receive table.
    pub fn unsubscribe(&self, handle: SubHandle) -> Result<()> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let mut ctx = ctx!(inner, now);
        inner.pd.unsubscribe(&mut ctx, handle)
    }

    /// Last valid payload of a subscription, with the timeout state in
    /// the result code.
    pub fn get(&self, handle: SubHandle) -> Result<(Vec<u8>, PdInfo)> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let ctx = ctx!(inner, now);
        inner.pd.get(&ctx, handle)
    }

    // ------------------------------------------------------------------
    // Message data
    // ------------------------------------------------------------------

    /// Register a listener for notifications and requests.
    pub fn add_listener(&self, spec: &ListenSpec) -> Result<ListenHandle> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let own_ip = inner.own_ip;
        let md_cfg = inner.md_cfg.clone();
        let mut ctx = ctx!(inner, now);
        inner.md.add_listener(&mut ctx, spec, &md_cfg, own_ip)
    }

    /// Remove a listener.
    pub fn remove_listener(&self, handle: ListenHandle) -> Result<()> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let mut ctx = ctx!(inner, now);
        inner.md.remove_listener(&mut ctx, handle)
    }

    /// Send a notification; nothing is awaited.
    pub fn notify(&self, spec: &RequestSpec) -> Result<()> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let own_ip = inner.own_ip;
        let md_cfg = inner.md_cfg.clone();
        let mut ctx = ctx!(inner, now);
        inner.md.notify(&mut ctx, spec, &md_cfg, own_ip)
    }

    /// Send a request and supervise its replies. Returns the session id
    /// replies will carry.
    pub fn request(&self, spec: &RequestSpec) -> Result<SessionId> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let own_ip = inner.own_ip;
        let md_cfg = inner.md_cfg.clone();
        let mut ctx = ctx!(inner, now);
        inner.md.request(&mut ctx, spec, &md_cfg, own_ip)
    }

    /// Answer a received request. With `confirm` the reply demands a
    /// confirmation and the engine supervises it.
    pub fn reply(
        &self,
        session_id: &SessionId,
        user_status: u32,
        confirm: bool,
        data: &[u8],
    ) -> Result<()> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let md_cfg = inner.md_cfg.clone();
        let mut ctx = ctx!(inner, now);
        inner.md.reply(&mut ctx, session_id, user_status, confirm, data, &md_cfg)
    }

    /// Answer a received request with an error status.
    pub fn reply_error(&self, session_id: &SessionId, user_status: u32) -> Result<()> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let md_cfg = inner.md_cfg.clone();
        let mut ctx = ctx!(inner, now);
        inner.md.reply_error(&mut ctx, session_id, user_status, &md_cfg)
    }

    /// Confirm a reply that demanded one.
    pub fn confirm(&self, session_id: &SessionId, user_status: u32) -> Result<()> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let md_cfg = inner.md_cfg.clone();
        let mut ctx = ctx!(inner, now);
        inner.md.confirm(&mut ctx, session_id, user_status, &md_cfg)
    }

    // ------------------------------------------------------------------
    // Session state
    // ------------------------------------------------------------------

    /// Set the topography counters validated on send and receive.
    pub fn set_topo_count(&self, etb: u32, op_trn: u32) -> Result<()> {
        let mut guard = self.lock()?;
        guard.topo = (etb, op_trn);
        Ok(())
    }

    /// Current topography counters.
    pub fn topo_count(&self) -> Result<(u32, u32)> {
        Ok(self.lock()?.topo)
    }

    /// Leader/follower switch for redundant publications. A follower
    /// stays quiet except for telegrams flagged redundant.
    pub fn set_redundant(&self, red_id: u32, leader: bool) -> Result<()> {
        let mut guard = self.lock()?;
        guard.red_id = red_id;
        guard.be_quiet = !leader;
        debug!(red_id, leader, "redundancy switched");
        Ok(())
    }

    /// Whether this session currently transmits (leader).
    pub fn redundant(&self) -> Result<bool> {
        Ok(!self.lock()?.be_quiet)
    }

    /// Redundancy group and leader state, as `(redId, leader)`.
    pub fn redundancy(&self) -> Result<(u32, bool)> {
        let guard = self.lock()?;
        Ok((guard.red_id, !guard.be_quiet))
    }

    /// Own address and redundancy-leader (virtual) address.
    pub fn addresses(&self) -> Result<(Ipv4Addr, Ipv4Addr)> {
        let guard = self.lock()?;
        Ok((guard.own_ip, guard.leader_ip))
    }

    /// Re-join all multicast groups after a link-down/link-up event.
    pub fn reinit(&self) -> Result<()> {
        let mut guard = self.lock()?;
        let now = TimeVal::now();
        let inner = &mut *guard;
        let own_ip = inner.own_ip;
        let mut ctx = ctx!(inner, now);
        inner.pd.reinit(&mut ctx, own_ip)
    }

    /// Snapshot of the statistics counters.
    pub fn statistics(&self) -> Result<SessionStats> {
        let guard = self.lock()?;
        let mut stats = guard.stats;
        stats.joined_mc = guard.pool.joined_mc();
        let (publications, subscriptions) = guard.pd.table_sizes();
        let (listeners, callers, repliers) = guard.md.table_sizes();
        stats.publications = publications as u32;
        stats.subscriptions = subscriptions as u32;
        stats.listeners = listeners as u32;
        stats.md_sessions = (callers + repliers) as u32;
        Ok(stats)
    }

    /// Frames sent by one publication.
    pub fn publication_stats(&self, handle: PubHandle) -> Result<u64> {
        self.lock()?.pd.pub_stats(handle)
    }

    /// Frames received and gaps seen by one subscription, as
    /// `(received, missed)`.
    pub fn subscription_stats(&self, handle: SubHandle) -> Result<(u64, u64)> {
        self.lock()?.pd.sub_stats(handle)
    }

    /// Zero the statistics counters.
    pub fn reset_statistics(&self) -> Result<()> {
        self.lock()?.stats.reset();
        Ok(())
    }

    /// Number of live socket pool entries (diagnostics).
    pub fn socket_count(&self) -> Result<usize> {
        Ok(self.lock()?.pool.len())
    }

    // ------------------------------------------------------------------
    // Process loop
    // ------------------------------------------------------------------

    /// Time until the next armed deadline (fallback 10 ms) and the
    /// descriptors worth selecting on.
    pub fn get_interval(&self) -> Result<(TimeVal, Vec<RawFd>)> {
        let guard = self.lock()?;
        let now = TimeVal::now();
        let interval = match guard.timers.next_deadline() {
            Some(deadline) => deadline.saturating_sub(now),
            None => DEFAULT_POLL_INTERVAL,
        };
        Ok((interval, guard.pool.fds()))
    }

    /// Timed select on the session's sockets, bounded by the next
    /// deadline. The only blocking call in the public surface.
    pub fn wait_for_event(&self, cap: Option<TimeVal>) -> Result<Vec<RawFd>> {
        let (mut interval, fds) = self.get_interval()?;
        if let Some(cap) = cap {
            interval = interval.min(cap);
        }

        // SAFETY: fd_set is plain data; FD_ZERO/FD_SET/FD_ISSET write
        // within its bounds for descriptors below FD_SETSIZE.
        unsafe {
            let mut set: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut set);
            let mut nfds = 0;
            for &fd in &fds {
                if fd as usize >= libc::FD_SETSIZE {
                    return Err(TrdpError::param(format!("descriptor {fd} beyond FD_SETSIZE")));
                }
                libc::FD_SET(fd, &mut set);
                nfds = nfds.max(fd + 1);
            }
            let mut tv = libc::timeval {
                tv_sec: interval.sec() as _,
                tv_usec: interval.usec() as _,
            };
            let rv = libc::select(
                nfds,
                &mut set,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            );
            if rv < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(Vec::new());
                }
                return Err(err.into());
            }
            Ok(fds
                .into_iter()
                .filter(|&fd| libc::FD_ISSET(fd, &set))
                .collect())
        }
    }

    /// One scheduler pass: send due publications, fire expired
    /// supervisions and MD timers, drain ready sockets, dispatch.
    ///
    /// `ready` restricts the drain to the given descriptors; `None`
    /// polls every socket. Callbacks run after the pass, outside the
    /// session lock.
    pub fn process(&self, ready: Option<&[RawFd]>) -> Result<()> {
        let mut pd_deliveries: PdDeliveries = Vec::new();
        let mut md_deliveries: MdDeliveries = Vec::new();

        let result = {
            let mut guard = self.lock()?;
            guard.process_pass(ready, &mut pd_deliveries, &mut md_deliveries)
        };

        for (callback, event) in pd_deliveries {
            callback(&event);
        }
        for (callback, event) in md_deliveries {
            callback(&event);
        }
        result
    }
}

impl SessionInner {
    fn process_pass(
        &mut self,
        ready: Option<&[RawFd]>,
        pd_deliveries: &mut PdDeliveries,
        md_deliveries: &mut MdDeliveries,
    ) -> Result<()> {
        // One time snapshot per pass; every deadline comparison in this
        // pass uses it.
        let now = TimeVal::now();
        let be_quiet = self.be_quiet;
        let md_cfg = self.md_cfg.clone();

        // Phase 1: expired deadlines.
        let due = self.timers.pop_due(now);
        {
            let inner = &mut *self;
            let mut ctx = ctx!(inner, now);
            for (_, key) in due {
                match key {
                    TimerKey::PdSend(id) => inner.pd.on_send_due(&mut ctx, id, be_quiet),
                    TimerKey::PdTimeout(id) => {
                        inner.pd.on_timeout_due(&mut ctx, id, pd_deliveries)
                    }
                    TimerKey::MdReply(id) => {
                        inner
                            .md
                            .on_reply_deadline(&mut ctx, id, &md_cfg, md_deliveries)
                    }
                    TimerKey::MdConfirm(id) => {
                        inner
                            .md
                            .on_confirm_deadline(&mut ctx, id, &md_cfg, md_deliveries)
                    }
                    TimerKey::SockIdle(idx) => ctx.pool.close_idle(idx as usize, now),
                }
            }
        }

        // Phase 2: drain sockets.
        let indices: Vec<usize> = match ready {
            Some(fds) => fds
                .iter()
                .filter_map(|&fd| self.pool.index_of_fd(fd))
                .collect(),
            None => self.pool.iter().map(|(i, _)| i).collect(),
        };
        for idx in indices {
            if let Err(e) = self.drain_socket(idx, now, pd_deliveries, md_deliveries) {
                if !e.is_transient() {
                    return Err(e);
                }
                warn!(idx, error = %e, "socket drain failed");
            }
        }

        // Phase 3: push out TCP backlog (completed connects,
        // writability).
        let pending: Vec<usize> = self
            .pool
            .iter()
            .filter(|(i, _)| self.pool.tcp_pending(*i))
            .map(|(i, _)| i)
            .collect();
        for idx in pending {
            if let Err(e) = self.pool.tcp_flush(idx) {
                warn!(idx, error = %e, "TCP flush failed");
            }
        }
        Ok(())
    }

    fn drain_socket(
        &mut self,
        idx: usize,
        now: TimeVal,
        pd_deliveries: &mut PdDeliveries,
        md_deliveries: &mut MdDeliveries,
    ) -> Result<()> {
        let Some(kind) = self.pool.entry(idx).map(|e| e.kind) else {
            return Ok(());
        };
        let md_cfg = self.md_cfg.clone();
        match kind {
            SockKind::PdUdp => {
                let mut rx_buf = std::mem::take(&mut self.rx_buf);
                let inner = &mut *self;
                let mut ctx = ctx!(inner, now);
                while let Some((len, src)) = ctx.pool.recv_udp(idx, &mut rx_buf)? {
                    inner
                        .pd
                        .receive(&mut ctx, &rx_buf[..len], *src.ip(), pd_deliveries);
                }
                self.rx_buf = rx_buf;
            }
            SockKind::MdUdp => {
                let mut rx_buf = std::mem::take(&mut self.rx_buf);
                let inner = &mut *self;
                let mut ctx = ctx!(inner, now);
                while let Some((len, src)) = ctx.pool.recv_udp(idx, &mut rx_buf)? {
                    inner.md.ingress(
                        &mut ctx,
                        &rx_buf[..len],
                        src,
                        idx,
                        false,
                        &md_cfg,
                        md_deliveries,
                    );
                }
                self.rx_buf = rx_buf;
            }
            SockKind::MdTcpListen => {
                let accepted = self.pool.accept(idx)?;
                for (stream, peer) in accepted {
                    let port = stream
                        .peer_addr()
                        .ok()
                        .map(|a| a.port())
                        .unwrap_or_default();
                    self.pool.adopt_stream(stream, peer, port)?;
                    debug!(%peer, "accepted MD connection");
                }
            }
            SockKind::MdTcpConn => {
                let (frames, closed) = self.pool.tcp_recv_frames(idx)?;
                let peer = self
                    .pool
                    .entry(idx)
                    .and_then(|e| e.peer_ip)
                    .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
                let port = self.pool.entry(idx).map(|e| e.port).unwrap_or_default();
                {
                    let inner = &mut *self;
                    let mut ctx = ctx!(inner, now);
                    for frame in frames {
                        inner.md.ingress(
                            &mut ctx,
                            &frame,
                            SocketAddrV4::new(peer, port),
                            idx,
                            true,
                            &md_cfg,
                            md_deliveries,
                        );
                    }
                }
                if closed {
                    debug!(%peer, "peer closed MD connection");
                    self.pool.close(idx);
                }
            }
        }
        Ok(())
    }
}
