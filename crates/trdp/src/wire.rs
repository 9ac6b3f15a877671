//! PD and MD frame layout, build and validation.
//!
//! All multi-byte integers are big-endian on the wire; the two frame check
//! sequence fields are little-endian (see [`crate::fcs`]). Headers are
//! `#[repr(C)]` structs with explicit-endian fields, so building a frame is
//! a struct write and parsing is a checked prefix cast, with no field-by-field
//! shifting and no alignment requirements on the receive buffer.

use bytes::BytesMut;
use zerocopy::byteorder::{BigEndian, LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Result, TrdpError};
use crate::fcs::{fcs32, fcs_check};

type Be16 = U16<BigEndian>;
type Be32 = U32<BigEndian>;
type Le32 = U32<LittleEndian>;

/// Protocol version spoken by this stack, `major.minor` packed big-endian.
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Default UDP port for process data.
pub const PD_UDP_PORT: u16 = 20548;

/// Default UDP and TCP port for message data.
pub const MD_PORT: u16 = 20550;

/// Size of a frame check sequence field.
pub const FCS_SIZE: usize = 4;

/// Fixed PD header size.
pub const PD_HEADER_SIZE: usize = size_of::<PdHeader>();

/// Fixed MD header size.
pub const MD_HEADER_SIZE: usize = size_of::<MdHeader>();

/// Maximum PD dataset size (one Ethernet frame).
pub const MAX_PD_DATA: usize = 1432;

/// Maximum MD dataset size.
pub const MAX_MD_DATA: usize = 65388;

/// Length of the URI fields in the MD header.
pub const URI_LEN: usize = 32;

/// Align a length to the 4-byte body boundary.
#[inline]
pub const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// On-wire size of a PD frame with `data_size` payload bytes.
///
/// PD carries no body check sequence; the body is padded to a 4-byte
/// boundary with zeros.
#[inline]
pub const fn pd_gross_size(data_size: usize) -> usize {
    PD_HEADER_SIZE + align4(data_size)
}

/// On-wire size of an MD frame with `data_size` payload bytes.
///
/// A non-empty body is padded to a 4-byte boundary and followed by a
/// 4-byte body check sequence; an empty body has neither.
#[inline]
pub const fn md_gross_size(data_size: usize) -> usize {
    if data_size == 0 {
        MD_HEADER_SIZE
    } else {
        MD_HEADER_SIZE + align4(data_size) + FCS_SIZE
    }
}

/// Message type, rendered on the wire as two ASCII bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Periodic process data.
    Pd,
    /// Process data reply to a pull request.
    Pe,
    /// Process data pull request.
    Pr,
    /// Message data notification (no reply).
    Mn,
    /// Message data request.
    Mr,
    /// Message data reply.
    Mp,
    /// Message data reply demanding confirmation.
    Mq,
    /// Message data confirmation.
    Mc,
    /// Message data reply error.
    Me,
}

impl MsgType {
    /// The on-wire value.
    pub const fn wire(self) -> u16 {
        match self {
            MsgType::Pd => 0x5064,
            MsgType::Pe => 0x5065,
            MsgType::Pr => 0x5072,
            MsgType::Mn => 0x4D6E,
            MsgType::Mr => 0x4D72,
            MsgType::Mp => 0x4D70,
            MsgType::Mq => 0x4D71,
            MsgType::Mc => 0x4D63,
            MsgType::Me => 0x4D65,
        }
    }

    /// Decode an on-wire value.
    pub const fn from_wire(value: u16) -> Option<MsgType> {
        Some(match value {
            0x5064 => MsgType::Pd,
            0x5065 => MsgType::Pe,
            0x5072 => MsgType::Pr,
            0x4D6E => MsgType::Mn,
            0x4D72 => MsgType::Mr,
            0x4D70 => MsgType::Mp,
            0x4D71 => MsgType::Mq,
            0x4D63 => MsgType::Mc,
            0x4D65 => MsgType::Me,
            _ => return None,
        })
    }

    /// Check for the process data family.
    pub const fn is_pd(self) -> bool {
        matches!(self, MsgType::Pd | MsgType::Pe | MsgType::Pr)
    }

    /// Check for the message data family.
    pub const fn is_md(self) -> bool {
        !self.is_pd()
    }

    /// Check for a reply-kind message (`Mp`, `Mq`, `Me`).
    pub const fn is_reply(self) -> bool {
        matches!(self, MsgType::Mp | MsgType::Mq | MsgType::Me)
    }
}

/// PD frame header (40 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PdHeader {
    /// Egress counter of the publication, starts at zero, wraps at 2^32.
    pub sequence_counter: Be32,
    /// Protocol version, major in the high byte.
    pub protocol_version: Be16,
    /// Message type (`Pd`, `Pe` or `Pr`).
    pub msg_type: Be16,
    /// Telegram identifier.
    pub com_id: Be32,
    /// Train backbone topography counter, 0 = local consist.
    pub etb_topo_count: Be32,
    /// Operational train topography counter, 0 = don't care.
    pub op_trn_topo_count: Be32,
    /// Unpadded payload length.
    pub dataset_length: Be32,
    /// Reserved, zero on send, ignored on receive.
    pub reserved: Be32,
    /// ComId a pull reply shall be published under.
    pub reply_com_id: Be32,
    /// Unicast address a pull reply shall go to.
    pub reply_ip_address: Be32,
    /// Header check sequence over the preceding 36 bytes.
    pub header_fcs: Le32,
}

/// MD frame header (116 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MdHeader {
    /// Egress counter of the session, bumped on retransmits.
    pub sequence_counter: Be32,
    /// Protocol version, major in the high byte.
    pub protocol_version: Be16,
    /// Message type (`Mn`, `Mr`, `Mp`, `Mq`, `Mc` or `Me`).
    pub msg_type: Be16,
    /// Telegram identifier.
    pub com_id: Be32,
    /// Train backbone topography counter, 0 = local consist.
    pub etb_topo_count: Be32,
    /// Operational train topography counter, 0 = don't care.
    pub op_trn_topo_count: Be32,
    /// Unpadded payload length.
    pub dataset_length: Be32,
    /// Application status on replies, zero otherwise.
    pub reply_status: Be32,
    /// Transaction identity, constant across request, replies, confirm
    /// and retransmits.
    pub session_id: [u8; 16],
    /// Caller's reply supervision interval in microseconds.
    pub reply_timeout: Be32,
    /// Logical source address, NUL-padded ASCII.
    pub source_uri: [u8; URI_LEN],
    /// Logical destination address, NUL-padded ASCII.
    pub destination_uri: [u8; URI_LEN],
    /// Header check sequence over the preceding 112 bytes.
    pub header_fcs: Le32,
}

impl PdHeader {
    /// Sequence counter as a native integer.
    pub fn seq(&self) -> u32 {
        self.sequence_counter.get()
    }

    /// ComId as a native integer.
    pub fn com_id(&self) -> u32 {
        self.com_id.get()
    }

    /// Message type, if valid.
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_wire(self.msg_type.get())
    }

    /// Both topography counters.
    pub fn topo(&self) -> (u32, u32) {
        (self.etb_topo_count.get(), self.op_trn_topo_count.get())
    }
}

impl MdHeader {
    /// Sequence counter as a native integer.
    pub fn seq(&self) -> u32 {
        self.sequence_counter.get()
    }

    /// ComId as a native integer.
    pub fn com_id(&self) -> u32 {
        self.com_id.get()
    }

    /// Message type, if valid.
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_wire(self.msg_type.get())
    }

    /// Both topography counters.
    pub fn topo(&self) -> (u32, u32) {
        (self.etb_topo_count.get(), self.op_trn_topo_count.get())
    }

    /// Source URI with NUL padding trimmed.
    pub fn source_uri(&self) -> &str {
        decode_uri(&self.source_uri)
    }

    /// Destination URI with NUL padding trimmed.
    pub fn destination_uri(&self) -> &str {
        decode_uri(&self.destination_uri)
    }
}

/// Encode a URI into the fixed NUL-padded header field.
pub fn encode_uri(uri: &str) -> Result<[u8; URI_LEN]> {
    if !uri.is_ascii() {
        return Err(TrdpError::param(format!("URI not ASCII: {uri:?}")));
    }
    if uri.len() > URI_LEN {
        return Err(TrdpError::param(format!(
            "URI longer than {URI_LEN} bytes: {uri:?}"
        )));
    }
    let mut field = [0u8; URI_LEN];
    field[..uri.len()].copy_from_slice(uri.as_bytes());
    Ok(field)
}

fn decode_uri(field: &[u8; URI_LEN]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(URI_LEN);
    // NUL-padded ASCII by construction; lossless for every frame that
    // passed validation, replacement-free fallback otherwise.
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

/// Identity of an MD frame used to build one without a header struct in
/// caller code.
#[derive(Debug, Clone)]
pub struct MdFrameSpec {
    /// Message type to send.
    pub msg_type: MsgType,
    /// Telegram identifier.
    pub com_id: u32,
    /// Session topography counters at build time.
    pub topo: (u32, u32),
    /// Application reply status (replies only).
    pub reply_status: u32,
    /// Transaction identity.
    pub session_id: [u8; 16],
    /// Reply supervision interval in microseconds.
    pub reply_timeout_us: u32,
    /// Logical source address.
    pub source_uri: [u8; URI_LEN],
    /// Logical destination address.
    pub destination_uri: [u8; URI_LEN],
}

/// Build a complete PD frame: header, payload, zero padding.
pub fn build_pd(
    msg_type: MsgType,
    com_id: u32,
    topo: (u32, u32),
    reply_com_id: u32,
    reply_ip: u32,
    payload: &[u8],
) -> BytesMut {
    let gross = pd_gross_size(payload.len());
    let mut frame = BytesMut::zeroed(gross);

    let (header, _) = PdHeader::mut_from_prefix(&mut frame[..]).expect("sized above");
    header.sequence_counter = 0.into();
    header.protocol_version = PROTOCOL_VERSION.into();
    header.msg_type = msg_type.wire().into();
    header.com_id = com_id.into();
    header.etb_topo_count = topo.0.into();
    header.op_trn_topo_count = topo.1.into();
    header.dataset_length = (payload.len() as u32).into();
    header.reply_com_id = reply_com_id.into();
    header.reply_ip_address = reply_ip.into();

    frame[PD_HEADER_SIZE..PD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    seal_pd(&mut frame);
    frame
}

/// Replace the payload of a built PD frame, growing or shrinking it.
///
/// The caller stamps the frame again before the next send.
pub fn set_pd_payload(frame: &mut BytesMut, payload: &[u8]) {
    frame.resize(pd_gross_size(payload.len()), 0);
    let (header, body) = PdHeader::mut_from_prefix(&mut frame[..]).expect("built frame");
    header.dataset_length = (payload.len() as u32).into();
    body[..payload.len()].copy_from_slice(payload);
    body[payload.len()..].fill(0);
}

/// Stamp a PD frame for sending: sequence, topography counters, header
/// check sequence.
pub fn stamp_pd(frame: &mut [u8], seq: u32, topo: (u32, u32)) {
    let (header, _) = PdHeader::mut_from_prefix(frame).expect("built frame");
    header.sequence_counter = seq.into();
    header.etb_topo_count = topo.0.into();
    header.op_trn_topo_count = topo.1.into();
    seal_pd(frame);
}

fn seal_pd(frame: &mut [u8]) {
    let fcs = fcs32(&frame[..PD_HEADER_SIZE - FCS_SIZE]);
    frame[PD_HEADER_SIZE - FCS_SIZE..PD_HEADER_SIZE].copy_from_slice(&fcs.to_le_bytes());
}

/// Build a complete MD frame: header, payload, zero padding, body check
/// sequence.
pub fn build_md(spec: &MdFrameSpec, seq: u32, payload: &[u8]) -> BytesMut {
    let gross = md_gross_size(payload.len());
    let mut frame = BytesMut::zeroed(gross);

    let (header, _) = MdHeader::mut_from_prefix(&mut frame[..]).expect("sized above");
    header.sequence_counter = seq.into();
    header.protocol_version = PROTOCOL_VERSION.into();
    header.msg_type = spec.msg_type.wire().into();
    header.com_id = spec.com_id.into();
    header.etb_topo_count = spec.topo.0.into();
    header.op_trn_topo_count = spec.topo.1.into();
    header.dataset_length = (payload.len() as u32).into();
    header.reply_status = spec.reply_status.into();
    header.session_id = spec.session_id;
    header.reply_timeout = spec.reply_timeout_us.into();
    header.source_uri = spec.source_uri;
    header.destination_uri = spec.destination_uri;

    frame[MD_HEADER_SIZE..MD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    seal_md(&mut frame, payload.len());
    frame
}

/// Re-stamp an MD frame for retransmission: bump the sequence counter,
/// keep the session identity, recompute the header check sequence.
pub fn stamp_md_retry(frame: &mut [u8], seq: u32) {
    let (header, _) = MdHeader::mut_from_prefix(frame).expect("built frame");
    header.sequence_counter = seq.into();
    let fcs = fcs32(&frame[..MD_HEADER_SIZE - FCS_SIZE]);
    frame[MD_HEADER_SIZE - FCS_SIZE..MD_HEADER_SIZE].copy_from_slice(&fcs.to_le_bytes());
}

fn seal_md(frame: &mut [u8], data_size: usize) {
    let fcs = fcs32(&frame[..MD_HEADER_SIZE - FCS_SIZE]);
    frame[MD_HEADER_SIZE - FCS_SIZE..MD_HEADER_SIZE].copy_from_slice(&fcs.to_le_bytes());
    if data_size > 0 {
        let body = fcs32(&frame[MD_HEADER_SIZE..MD_HEADER_SIZE + data_size]);
        let trailer = frame.len() - FCS_SIZE;
        frame[trailer..].copy_from_slice(&body.to_le_bytes());
    }
}

/// A validated PD frame.
#[derive(Debug)]
pub struct PdView<'a> {
    /// The checked header.
    pub header: &'a PdHeader,
    /// The unpadded payload.
    pub payload: &'a [u8],
    /// The message type (already range-checked).
    pub msg_type: MsgType,
}

/// A validated MD frame.
#[derive(Debug)]
pub struct MdView<'a> {
    /// The checked header.
    pub header: &'a MdHeader,
    /// The unpadded payload.
    pub payload: &'a [u8],
    /// The message type (already range-checked).
    pub msg_type: MsgType,
}

/// Validate a received PD frame against the session's topography.
///
/// Checks run in a fixed order (length bounds, header check sequence,
/// protocol version, message type, exact length, topography) and the
/// first failure is returned. A zero topography counter on either side
/// disables that counter's comparison.
pub fn validate_pd(frame: &[u8], local_topo: (u32, u32)) -> Result<PdView<'_>> {
    if frame.len() < PD_HEADER_SIZE || frame.len() > pd_gross_size(MAX_PD_DATA) {
        return Err(TrdpError::wire(
            0,
            format!("PD frame length {} out of range", frame.len()),
        ));
    }
    if !fcs_check(&frame[..PD_HEADER_SIZE]) {
        return Err(TrdpError::Crc { span: "header" });
    }

    let (header, _) = PdHeader::ref_from_prefix(frame).expect("length checked");
    check_version(header.protocol_version.get())?;

    let msg_type = header
        .msg_type()
        .filter(|t| t.is_pd())
        .ok_or_else(|| {
            TrdpError::wire(6, format!("bad PD message type {:#06x}", header.msg_type.get()))
        })?;

    let dsl = header.dataset_length.get() as usize;
    if dsl > MAX_PD_DATA {
        return Err(TrdpError::wire(20, format!("dataset length {dsl} exceeds maximum")));
    }
    if frame.len() != pd_gross_size(dsl) {
        return Err(TrdpError::wire(
            20,
            format!(
                "frame length {} does not match dataset length {dsl}",
                frame.len()
            ),
        ));
    }
    check_topo(header.topo(), local_topo)?;

    Ok(PdView {
        header,
        payload: &frame[PD_HEADER_SIZE..PD_HEADER_SIZE + dsl],
        msg_type,
    })
}

/// Validate a received MD frame against the session's topography.
///
/// Same discipline as [`validate_pd`], with the body check sequence
/// verified right after the header one.
pub fn validate_md(frame: &[u8], local_topo: (u32, u32)) -> Result<MdView<'_>> {
    if frame.len() < MD_HEADER_SIZE || frame.len() > md_gross_size(MAX_MD_DATA) {
        return Err(TrdpError::wire(
            0,
            format!("MD frame length {} out of range", frame.len()),
        ));
    }
    if !fcs_check(&frame[..MD_HEADER_SIZE]) {
        return Err(TrdpError::Crc { span: "header" });
    }

    let (header, _) = MdHeader::ref_from_prefix(frame).expect("length checked");
    let dsl = header.dataset_length.get() as usize;
    if dsl > 0 {
        // The body FCS trails the padded body; both must be present
        // before the span can be verified.
        if frame.len() < md_gross_size(dsl) {
            return Err(TrdpError::wire(
                20,
                format!("frame length {} too short for dataset length {dsl}", frame.len()),
            ));
        }
        let body = &frame[MD_HEADER_SIZE..MD_HEADER_SIZE + dsl];
        let trailer = &frame[frame.len() - FCS_SIZE..];
        let stored = u32::from_le_bytes(trailer.try_into().expect("four bytes"));
        if fcs32(body) != stored {
            return Err(TrdpError::Crc { span: "body" });
        }
    }

    check_version(header.protocol_version.get())?;

    let msg_type = header
        .msg_type()
        .filter(|t| t.is_md())
        .ok_or_else(|| {
            TrdpError::wire(6, format!("bad MD message type {:#06x}", header.msg_type.get()))
        })?;

    if frame.len() != md_gross_size(dsl) {
        return Err(TrdpError::wire(
            20,
            format!(
                "frame length {} does not match dataset length {dsl}",
                frame.len()
            ),
        ));
    }
    check_topo(header.topo(), local_topo)?;

    Ok(MdView {
        header,
        payload: &frame[MD_HEADER_SIZE..MD_HEADER_SIZE + dsl],
        msg_type,
    })
}

fn check_version(version: u16) -> Result<()> {
    if version & 0xFF00 != PROTOCOL_VERSION & 0xFF00 {
        return Err(TrdpError::wire(
            4,
            format!("protocol version {version:#06x}, expected major {:#04x}", PROTOCOL_VERSION >> 8),
        ));
    }
    Ok(())
}

fn check_topo(frame: (u32, u32), local: (u32, u32)) -> Result<()> {
    let mismatch = |f: u32, l: u32| f != 0 && l != 0 && f != l;
    if mismatch(frame.0, local.0) || mismatch(frame.1, local.1) {
        return Err(TrdpError::Topo { frame, local });
    }
    Ok(())
}
