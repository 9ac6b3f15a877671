//! Socket pool shared by the engines of one session.
//!
//! Sockets are expensive on embedded targets, so telegrams never own
//! them. The pool keys endpoints by `(kind, bind address, port, QoS/TTL)`
//! and hands out indices; every publish/subscribe/listen call either
//! bumps the reference count of a matching entry or creates one. UDP
//! entries close as soon as the count drops to zero; connected TCP
//! entries linger until the idle deadline so back-to-back transactions
//! with the same peer reuse the connection.
//!
//! All sockets are non-blocking. The session exposes their descriptors
//! through `get_interval` and drains whichever ones the caller reports
//! ready; the pool itself never sleeps.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};
use zerocopy::FromBytes;

use crate::config::SendParam;
use crate::error::{Result, TrdpError};
use crate::time::TimeVal;
use crate::wire::{self, MD_HEADER_SIZE, MAX_MD_DATA, MdHeader};

/// Upper bound on multicast groups joined through one socket.
pub const MAX_MC_JOINS: usize = 20;

/// What an entry is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    /// Process data over UDP.
    PdUdp,
    /// Message data over UDP.
    MdUdp,
    /// Message data TCP listener.
    MdTcpListen,
    /// One connected message data TCP stream.
    MdTcpConn,
}

enum Endpoint {
    Udp(UdpSocket),
    Listener(TcpListener),
    Stream(TcpStream),
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Udp(s) => write!(f, "Udp(fd {})", s.as_raw_fd()),
            Endpoint::Listener(s) => write!(f, "Listener(fd {})", s.as_raw_fd()),
            Endpoint::Stream(s) => write!(f, "Stream(fd {})", s.as_raw_fd()),
        }
    }
}

/// Reassembly and backlog state of a connected TCP entry.
#[derive(Debug, Default)]
struct TcpState {
    /// Still waiting for the non-blocking connect to complete.
    connecting: bool,
    /// Frames (or frame tails) not yet written out.
    backlog: VecDeque<BytesMut>,
    /// Partially received frame bytes.
    rx: BytesMut,
}

/// One pooled endpoint.
#[derive(Debug)]
pub struct PoolEntry {
    /// What the entry is used for.
    pub kind: SockKind,
    /// Address the socket is bound to.
    pub bind_ip: Ipv4Addr,
    /// Bound (UDP, listener) or remote (connected TCP) port.
    pub port: u16,
    /// QoS/TTL the socket was configured with.
    pub send_param: SendParam,
    /// Reference count; the entry dies only at zero.
    pub usage: u32,
    /// Accepted (server-side) TCP connections never send requests.
    pub rcv_only: bool,
    /// Remote address of a connected TCP entry.
    pub peer_ip: Option<Ipv4Addr>,
    /// Idle deadline of an unused TCP entry.
    pub idle_deadline: Option<TimeVal>,
    joined: Vec<Ipv4Addr>,
    endpoint: Endpoint,
    tcp: TcpState,
}

impl PoolEntry {
    /// The raw descriptor, for select/poll integration.
    pub fn raw_fd(&self) -> RawFd {
        match &self.endpoint {
            Endpoint::Udp(s) => s.as_raw_fd(),
            Endpoint::Listener(s) => s.as_raw_fd(),
            Endpoint::Stream(s) => s.as_raw_fd(),
        }
    }

    /// Multicast groups currently joined.
    pub fn joined(&self) -> &[Ipv4Addr] {
        &self.joined
    }
}

/// The socket pool of one session.
#[derive(Debug, Default)]
pub struct SocketPool {
    entries: Vec<Option<PoolEntry>>,
}

impl SocketPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry by index.
    pub fn entry(&self, idx: usize) -> Option<&PoolEntry> {
        self.entries.get(idx).and_then(|e| e.as_ref())
    }

    fn entry_mut(&mut self, idx: usize) -> Result<&mut PoolEntry> {
        self.entries
            .get_mut(idx)
            .and_then(|e| e.as_mut())
            .ok_or_else(|| TrdpError::param(format!("stale socket index {idx}")))
    }

    /// Iterate over live entries as `(index, entry)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &PoolEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i, e)))
    }

    /// Descriptors of every live entry.
    pub fn fds(&self) -> Vec<RawFd> {
        self.iter().map(|(_, e)| e.raw_fd()).collect()
    }

    /// Index of the entry owning a descriptor.
    pub fn index_of_fd(&self, fd: RawFd) -> Option<usize> {
        self.iter().find(|(_, e)| e.raw_fd() == fd).map(|(i, _)| i)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Check for an empty pool.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total multicast joins across the pool.
    pub fn joined_mc(&self) -> u32 {
        self.iter().map(|(_, e)| e.joined.len() as u32).sum()
    }

    fn insert(&mut self, entry: PoolEntry) -> usize {
        match self.entries.iter_mut().enumerate().find(|(_, e)| e.is_none()) {
            Some((idx, slot)) => {
                *slot = Some(entry);
                idx
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        }
    }

    /// Acquire a UDP endpoint, sharing an existing one with the same
    /// key.
    pub fn request_udp(
        &mut self,
        kind: SockKind,
        bind_ip: Ipv4Addr,
        port: u16,
        send_param: SendParam,
    ) -> Result<usize> {
        debug_assert!(matches!(kind, SockKind::PdUdp | SockKind::MdUdp));
        let existing = self
            .iter()
            .find(|(_, e)| {
                e.kind == kind
                    && e.bind_ip == bind_ip
                    && e.port == port
                    && e.send_param == send_param
            })
            .map(|(idx, _)| idx);
        if let Some(idx) = existing {
            self.entry_mut(idx)?.usage += 1;
            return Ok(idx);
        }

        let socket = udp_socket(bind_ip, port, send_param)?;
        let idx = self.insert(PoolEntry {
            kind,
            bind_ip,
            port,
            send_param,
            usage: 1,
            rcv_only: false,
            peer_ip: None,
            idle_deadline: None,
            joined: Vec::new(),
            endpoint: Endpoint::Udp(socket),
            tcp: TcpState::default(),
        });
        debug!(?kind, %bind_ip, port, "opened UDP socket");
        Ok(idx)
    }

    /// Acquire the TCP listener for `(bind_ip, port)`, creating it on
    /// first use.
    pub fn request_tcp_listener(&mut self, bind_ip: Ipv4Addr, port: u16) -> Result<usize> {
        let existing = self
            .iter()
            .find(|(_, e)| e.kind == SockKind::MdTcpListen && e.bind_ip == bind_ip && e.port == port)
            .map(|(idx, _)| idx);
        if let Some(idx) = existing {
            self.entry_mut(idx)?.usage += 1;
            return Ok(idx);
        }

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(bind_ip, port).into())?;
        socket.listen(8)?;
        let idx = self.insert(PoolEntry {
            kind: SockKind::MdTcpListen,
            bind_ip,
            port,
            send_param: SendParam::MD,
            usage: 1,
            rcv_only: true,
            peer_ip: None,
            idle_deadline: None,
            joined: Vec::new(),
            endpoint: Endpoint::Listener(socket.into()),
            tcp: TcpState::default(),
        });
        debug!(%bind_ip, port, "opened TCP listener");
        Ok(idx)
    }

    /// Acquire a connected TCP endpoint to `peer`, reusing a live
    /// outgoing connection to the same peer.
    pub fn connect_tcp(
        &mut self,
        peer: Ipv4Addr,
        port: u16,
        send_param: SendParam,
    ) -> Result<usize> {
        let existing = self
            .iter()
            .find(|(_, e)| {
                e.kind == SockKind::MdTcpConn
                    && !e.rcv_only
                    && e.peer_ip == Some(peer)
                    && e.port == port
            })
            .map(|(idx, _)| idx);
        if let Some(idx) = existing {
            let entry = self.entry_mut(idx)?;
            entry.usage += 1;
            entry.idle_deadline = None;
            return Ok(idx);
        }

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        set_qos(&socket, send_param);
        let connecting = match socket.connect(&SocketAddrV4::new(peer, port).into()) {
            Ok(()) => false,
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => return Err(e.into()),
        };
        let idx = self.insert(PoolEntry {
            kind: SockKind::MdTcpConn,
            bind_ip: Ipv4Addr::UNSPECIFIED,
            port,
            send_param,
            usage: 1,
            rcv_only: false,
            peer_ip: Some(peer),
            idle_deadline: None,
            joined: Vec::new(),
            endpoint: Endpoint::Stream(socket.into()),
            tcp: TcpState {
                connecting,
                ..TcpState::default()
            },
        });
        debug!(%peer, port, connecting, "opened TCP connection");
        Ok(idx)
    }

    /// Adopt a stream accepted from the listener. The entry is
    /// receive-only and starts with one reference.
    pub fn adopt_stream(&mut self, stream: TcpStream, peer: Ipv4Addr, port: u16) -> Result<usize> {
        stream.set_nonblocking(true)?;
        Ok(self.insert(PoolEntry {
            kind: SockKind::MdTcpConn,
            bind_ip: Ipv4Addr::UNSPECIFIED,
            port,
            send_param: SendParam::MD,
            usage: 1,
            rcv_only: true,
            peer_ip: Some(peer),
            idle_deadline: None,
            joined: Vec::new(),
            endpoint: Endpoint::Stream(stream),
            tcp: TcpState::default(),
        }))
    }

    /// Take one more reference on an existing entry (a replier session
    /// adopting the socket its request arrived on).
    pub fn retain(&mut self, idx: usize) -> Result<()> {
        let entry = self.entry_mut(idx)?;
        entry.usage += 1;
        entry.idle_deadline = None;
        Ok(())
    }

    /// Drop one reference. A UDP entry closes at zero; a TCP entry is
    /// armed with an idle deadline and reaped by [`Self::close_idle`].
    /// Returns the armed deadline, if any.
    pub fn release(
        &mut self,
        idx: usize,
        now: TimeVal,
        connect_timeout: TimeVal,
    ) -> Result<Option<TimeVal>> {
        let entry = self.entry_mut(idx)?;
        debug_assert!(entry.usage > 0, "release without matching request");
        entry.usage = entry.usage.saturating_sub(1);
        if entry.usage > 0 {
            return Ok(None);
        }
        match entry.kind {
            SockKind::MdTcpConn => {
                let deadline = now + connect_timeout;
                entry.idle_deadline = Some(deadline);
                Ok(Some(deadline))
            }
            _ => {
                debug!(idx, kind = ?entry.kind, "closing socket");
                self.entries[idx] = None;
                Ok(None)
            }
        }
    }

    /// Close a TCP entry whose idle deadline passed. A revived entry
    /// (usage back above zero) is left alone.
    pub fn close_idle(&mut self, idx: usize, now: TimeVal) {
        if let Some(Some(entry)) = self.entries.get_mut(idx) {
            if entry.usage == 0 && entry.idle_deadline.is_some_and(|d| d <= now) {
                debug!(idx, peer = ?entry.peer_ip, "reaping idle TCP connection");
                self.entries[idx] = None;
            }
        }
    }

    /// Drop an entry unconditionally (session teardown, dead peer).
    pub fn close(&mut self, idx: usize) {
        if let Some(slot) = self.entries.get_mut(idx) {
            *slot = None;
        }
    }

    /// Join a multicast group on a UDP entry. Joins are idempotent and
    /// bounded per socket.
    pub fn join_multicast(&mut self, idx: usize, group: Ipv4Addr, local: Ipv4Addr) -> Result<()> {
        let entry = self.entry_mut(idx)?;
        if entry.joined.contains(&group) {
            return Ok(());
        }
        if entry.joined.len() >= MAX_MC_JOINS {
            return Err(TrdpError::param(format!(
                "socket {idx} already joined {MAX_MC_JOINS} multicast groups"
            )));
        }
        let Endpoint::Udp(socket) = &entry.endpoint else {
            return Err(TrdpError::param("multicast join on a TCP entry"));
        };
        socket.join_multicast_v4(&group, &local)?;
        entry.joined.push(group);
        trace!(idx, %group, "joined multicast group");
        Ok(())
    }

    /// Leave a multicast group joined earlier. Unknown groups are
    /// ignored.
    pub fn leave_multicast(&mut self, idx: usize, group: Ipv4Addr, local: Ipv4Addr) -> Result<()> {
        let entry = self.entry_mut(idx)?;
        let Some(pos) = entry.joined.iter().position(|&g| g == group) else {
            return Ok(());
        };
        let Endpoint::Udp(socket) = &entry.endpoint else {
            return Err(TrdpError::param("multicast leave on a TCP entry"));
        };
        socket.leave_multicast_v4(&group, &local)?;
        entry.joined.remove(pos);
        Ok(())
    }

    /// Re-join every multicast group recorded on an entry, after a
    /// link-down/link-up cycle.
    pub fn rejoin_multicast(&mut self, idx: usize, local: Ipv4Addr) -> Result<()> {
        let entry = self.entry_mut(idx)?;
        if let Endpoint::Udp(socket) = &entry.endpoint {
            for group in &entry.joined {
                if let Err(e) = socket.join_multicast_v4(group, &local) {
                    // Already-joined is the expected answer on a healthy
                    // link.
                    if e.raw_os_error() != Some(libc::EADDRINUSE) {
                        warn!(idx, %group, error = %e, "multicast re-join failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Send one datagram.
    pub fn send_udp(&mut self, idx: usize, frame: &[u8], dest: Ipv4Addr, port: u16) -> Result<()> {
        let entry = self.entry_mut(idx)?;
        let Endpoint::Udp(socket) = &entry.endpoint else {
            return Err(TrdpError::param("UDP send on a TCP entry"));
        };
        match socket.send_to(frame, SocketAddrV4::new(dest, port)) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TrdpError::Block),
            Err(e) => Err(e.into()),
        }
    }

    /// Receive one datagram into `buf`. `None` when the socket has
    /// nothing more to deliver.
    pub fn recv_udp(
        &mut self,
        idx: usize,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddrV4)>> {
        let entry = self.entry_mut(idx)?;
        let Endpoint::Udp(socket) = &entry.endpoint else {
            return Err(TrdpError::param("UDP receive on a TCP entry"));
        };
        match socket.recv_from(buf) {
            Ok((len, SocketAddr::V4(src))) => Ok(Some((len, src))),
            Ok((_, SocketAddr::V6(_))) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Accept every pending connection on a listener entry.
    pub fn accept(&mut self, idx: usize) -> Result<Vec<(TcpStream, Ipv4Addr)>> {
        let entry = self.entry_mut(idx)?;
        let Endpoint::Listener(listener) = &entry.endpoint else {
            return Err(TrdpError::param("accept on a non-listener entry"));
        };
        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok((stream, SocketAddr::V4(peer))) => accepted.push((stream, *peer.ip())),
                Ok((_, SocketAddr::V6(_))) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(accepted)
    }

    /// Queue a frame on a connected TCP entry and push out as much of
    /// the backlog as the socket accepts.
    pub fn tcp_send(&mut self, idx: usize, frame: BytesMut) -> Result<()> {
        let entry = self.entry_mut(idx)?;
        entry.tcp.backlog.push_back(frame);
        Self::flush_entry(entry)
    }

    /// Push out backlog on a connected TCP entry (connect completion,
    /// writability).
    pub fn tcp_flush(&mut self, idx: usize) -> Result<()> {
        let entry = self.entry_mut(idx)?;
        Self::flush_entry(entry)
    }

    fn flush_entry(entry: &mut PoolEntry) -> Result<()> {
        let Endpoint::Stream(stream) = &mut entry.endpoint else {
            return Err(TrdpError::param("TCP send on a datagram entry"));
        };
        while let Some(frame) = entry.tcp.backlog.front_mut() {
            match stream.write(frame) {
                Ok(n) => {
                    entry.tcp.connecting = false;
                    if n == frame.len() {
                        entry.tcp.backlog.pop_front();
                    } else {
                        let _ = frame.split_to(n);
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotConnected && entry.tcp.connecting => {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Whether a TCP entry still has unflushed frames.
    pub fn tcp_pending(&self, idx: usize) -> bool {
        self.entry(idx)
            .is_some_and(|e| !e.tcp.backlog.is_empty() || e.tcp.connecting)
    }

    /// Drain a connected TCP entry: read what the socket has, reassemble
    /// complete MD frames (header first, then `datasetLength` plus the
    /// body check sequence). Returns the frames and whether the peer
    /// closed.
    pub fn tcp_recv_frames(&mut self, idx: usize) -> Result<(Vec<BytesMut>, bool)> {
        let entry = self.entry_mut(idx)?;
        let Endpoint::Stream(stream) = &mut entry.endpoint else {
            return Err(TrdpError::param("TCP receive on a datagram entry"));
        };

        let mut closed = false;
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => entry.tcp.rx.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        let mut frames = Vec::new();
        loop {
            let rx = &entry.tcp.rx;
            if rx.len() < MD_HEADER_SIZE {
                break;
            }
            let (header, _) = MdHeader::ref_from_prefix(&rx[..]).expect("length checked");
            let dsl = header.dataset_length.get() as usize;
            if dsl > MAX_MD_DATA {
                // The stream is out of sync; nothing downstream can
                // recover framing.
                entry.tcp.rx.clear();
                return Err(TrdpError::wire(
                    20,
                    format!("TCP stream out of sync: dataset length {dsl}"),
                ));
            }
            let total = wire::md_gross_size(dsl);
            if rx.len() < total {
                break;
            }
            frames.push(entry.tcp.rx.split_to(total));
        }
        Ok((frames, closed))
    }
}

/// Build one configured, bound, non-blocking UDP socket.
fn udp_socket(bind_ip: Ipv4Addr, port: u16, send_param: SendParam) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.set_ttl(send_param.ttl as u32)?;
    socket.set_multicast_ttl_v4(send_param.ttl as u32)?;
    set_qos(&socket, send_param);
    socket.bind(&SocketAddrV4::new(bind_ip, port).into())?;
    Ok(socket.into())
}

/// Map the QoS class into the IP TOS precedence bits. Refusal (container
/// policies) costs priority, not connectivity.
fn set_qos(socket: &Socket, send_param: SendParam) {
    if let Err(e) = socket.set_tos((send_param.qos as u32) << 5) {
        debug!(qos = send_param.qos, error = %e, "could not set IP TOS");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_udp(port: u16) -> (SocketPool, usize) {
        let mut pool = SocketPool::new();
        let idx = pool
            .request_udp(SockKind::PdUdp, Ipv4Addr::LOCALHOST, port, SendParam::PD)
            .unwrap();
        (pool, idx)
    }

    #[test]
    fn test_udp_sharing_by_key() {
        let (mut pool, idx) = pool_with_udp(0);
        // Same key: shared.
        let again = pool
            .request_udp(SockKind::PdUdp, Ipv4Addr::LOCALHOST, 0, SendParam::PD)
            .unwrap();
        assert_eq!(again, idx);
        assert_eq!(pool.entry(idx).unwrap().usage, 2);
        // Different QoS: separate socket.
        let other = pool
            .request_udp(
                SockKind::PdUdp,
                Ipv4Addr::LOCALHOST,
                0,
                SendParam { qos: 7, ttl: 16 },
            )
            .unwrap();
        assert_ne!(other, idx);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_release_balances_to_empty() {
        let (mut pool, idx) = pool_with_udp(0);
        let port = pool.entry(idx).unwrap().port;
        let again = pool
            .request_udp(SockKind::PdUdp, Ipv4Addr::LOCALHOST, port, SendParam::PD)
            .unwrap();
        let now = TimeVal::now();
        assert!(pool.release(idx, now, TimeVal::ZERO).unwrap().is_none());
        assert_eq!(pool.entry(again).unwrap().usage, 1);
        assert!(pool.release(again, now, TimeVal::ZERO).unwrap().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_udp_loopback_round_trip() {
        let mut pool = SocketPool::new();
        let a = pool
            .request_udp(SockKind::PdUdp, Ipv4Addr::LOCALHOST, 0, SendParam::PD)
            .unwrap();
        // A different QoS key forces a second socket.
        let b = pool
            .request_udp(
                SockKind::PdUdp,
                Ipv4Addr::LOCALHOST,
                0,
                SendParam { qos: 6, ttl: 64 },
            )
            .unwrap();
        let b_port = match pool.entry(b).unwrap().endpoint {
            Endpoint::Udp(ref s) => s.local_addr().unwrap().port(),
            _ => unreachable!(),
        };
        pool.send_udp(a, b"frame", Ipv4Addr::LOCALHOST, b_port).unwrap();

        let mut buf = [0u8; 64];
        let mut got = None;
        for _ in 0..100 {
            if let Some((len, src)) = pool.recv_udp(b, &mut buf).unwrap() {
                got = Some((len, src));
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let (len, src) = got.expect("datagram arrives on loopback");
        assert_eq!(&buf[..len], b"frame");
        assert_eq!(*src.ip(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_recv_without_traffic_is_none() {
        let (mut pool, idx) = pool_with_udp(0);
        let mut buf = [0u8; 16];
        assert!(pool.recv_udp(idx, &mut buf).unwrap().is_none());
    }

    #[test]
    fn test_multicast_join_bookkeeping() {
        let (mut pool, idx) = pool_with_udp(0);
        let group = Ipv4Addr::new(239, 255, 0, 1);
        pool.join_multicast(idx, group, Ipv4Addr::UNSPECIFIED).unwrap();
        // Idempotent.
        pool.join_multicast(idx, group, Ipv4Addr::UNSPECIFIED).unwrap();
        assert_eq!(pool.entry(idx).unwrap().joined(), &[group]);
        assert_eq!(pool.joined_mc(), 1);
        pool.leave_multicast(idx, group, Ipv4Addr::UNSPECIFIED).unwrap();
        assert!(pool.entry(idx).unwrap().joined().is_empty());
        // Leaving again is a no-op.
        pool.leave_multicast(idx, group, Ipv4Addr::UNSPECIFIED).unwrap();
    }

    #[test]
    fn test_tcp_idle_reaping() {
        let mut pool = SocketPool::new();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let idx = pool
            .connect_tcp(Ipv4Addr::LOCALHOST, port, SendParam::MD)
            .unwrap();

        let now = TimeVal::now();
        let deadline = pool
            .release(idx, now, TimeVal::from_millis(50))
            .unwrap()
            .expect("idle deadline armed");
        assert_eq!(deadline, now + TimeVal::from_millis(50));
        // Too early: entry survives.
        pool.close_idle(idx, now);
        assert!(pool.entry(idx).is_some());
        // Revived before the deadline: survives the reaper.
        let again = pool
            .connect_tcp(Ipv4Addr::LOCALHOST, port, SendParam::MD)
            .unwrap();
        assert_eq!(again, idx);
        pool.close_idle(idx, deadline + TimeVal::from_millis(1));
        assert!(pool.entry(idx).is_some());
        // Released and expired: reaped.
        pool.release(idx, now, TimeVal::from_millis(50)).unwrap();
        pool.close_idle(idx, deadline + TimeVal::from_millis(1));
        assert!(pool.entry(idx).is_none());
    }

    #[test]
    fn test_tcp_frame_reassembly_across_reads() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut pool = SocketPool::new();
        let idx = pool
            .connect_tcp(Ipv4Addr::LOCALHOST, port, SendParam::MD)
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let spec = wire::MdFrameSpec {
            msg_type: wire::MsgType::Mn,
            com_id: 9,
            topo: (0, 0),
            reply_status: 0,
            session_id: [0; 16],
            reply_timeout_us: 0,
            source_uri: [0; wire::URI_LEN],
            destination_uri: [0; wire::URI_LEN],
        };
        let frame = wire::build_md(&spec, 0, b"notify-body");

        // First half, then the rest: the pool must not emit a frame
        // until it is whole.
        peer.write_all(&frame[..60]).unwrap();
        peer.flush().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (frames, closed) = pool.tcp_recv_frames(idx).unwrap();
        assert!(frames.is_empty());
        assert!(!closed);

        peer.write_all(&frame[60..]).unwrap();
        drop(peer);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (frames, closed) = pool.tcp_recv_frames(idx).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame[..]);
        assert!(closed);
    }
}
