//! Schema-driven dataset marshalling.
//!
//! Applications hand the stack datasets in host layout: scalars at their
//! natural (or configured) alignment, native byte order, dynamic arrays as
//! a `u16` count followed by the items. On the wire the same dataset is
//! packed: no alignment padding, big-endian scalars, the `u16` count
//! preceding dynamic items. The transform is driven entirely by tables
//! supplied at init (a ComId to dataset map plus dataset descriptors) and is
//! bidirectional: `unmarshall(marshall(x))` reproduces `x` byte for byte.
//!
//! Both traversals are range-checked; reading past the source is a
//! parameter error, writing past the destination a memory error. Dataset
//! references nest up to eight levels, and reference cycles are rejected
//! once at table load instead of on every call.

use crate::error::{Result, TrdpError};

/// Maximum dataset nesting depth.
pub const MAX_DS_DEPTH: usize = 8;

/// Leaf element types with fixed wire widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeafType {
    /// 8-bit boolean, one bit relevant.
    Bool8,
    /// 8-bit character, also used for UTF-8 text.
    Char8,
    /// UTF-16 code unit.
    Utf16,
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 8-bit integer.
    UInt8,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// IEEE 754 single precision.
    Real32,
    /// IEEE 754 double precision.
    Real64,
    /// 32-bit UNIX time.
    TimeDate32,
    /// TCN time: 32-bit seconds plus 16-bit ticks.
    TimeDate48,
    /// 32-bit seconds plus 32-bit microseconds.
    TimeDate64,
}

impl LeafType {
    const COUNT: usize = 16;

    const fn index(self) -> usize {
        self as usize
    }

    /// Width of one element on the wire.
    pub const fn wire_size(self) -> usize {
        match self {
            LeafType::Bool8 | LeafType::Char8 | LeafType::Int8 | LeafType::UInt8 => 1,
            LeafType::Utf16 | LeafType::Int16 | LeafType::UInt16 => 2,
            LeafType::Int32
            | LeafType::UInt32
            | LeafType::Real32
            | LeafType::TimeDate32 => 4,
            LeafType::TimeDate48 => 6,
            LeafType::Int64 | LeafType::UInt64 | LeafType::Real64 | LeafType::TimeDate64 => 8,
        }
    }

    const fn is_signed(self) -> bool {
        matches!(
            self,
            LeafType::Int8 | LeafType::Int16 | LeafType::Int32 | LeafType::Int64
        )
    }
}

/// Element type: a leaf scalar or a reference to another dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    /// A scalar of fixed width.
    Leaf(LeafType),
    /// A nested dataset, by dataset id.
    Dataset(u32),
}

/// One element of a dataset descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    /// Element type.
    pub ty: ElemType,
    /// `0` = dynamic array (u16 count on the wire), `1` = scalar,
    /// `n > 1` = fixed array.
    pub count: u32,
}

impl Element {
    /// A single scalar element.
    pub const fn scalar(ty: LeafType) -> Self {
        Element {
            ty: ElemType::Leaf(ty),
            count: 1,
        }
    }

    /// A fixed array of `n` scalars.
    pub const fn array(ty: LeafType, n: u32) -> Self {
        Element {
            ty: ElemType::Leaf(ty),
            count: n,
        }
    }

    /// A dynamic array of scalars.
    pub const fn dynamic(ty: LeafType) -> Self {
        Element {
            ty: ElemType::Leaf(ty),
            count: 0,
        }
    }

    /// A nested dataset reference.
    pub const fn dataset(ds_id: u32, count: u32) -> Self {
        Element {
            ty: ElemType::Dataset(ds_id),
            count,
        }
    }
}

/// A dataset descriptor: an ordered list of elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    /// Dataset id, referenced by the ComId map and by nested elements.
    pub id: u32,
    /// The elements, in wire order.
    pub elements: Vec<Element>,
}

/// Host widths and alignments for the leaf types.
///
/// The default is the natural layout: host width equals wire width (the
/// two composite time types take their padded struct size). Platforms
/// with unusual in-memory models, such as code generators that widen
/// every integer to the machine word, supply their own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLayout {
    sizes: [u8; LeafType::COUNT],
    aligns: [u8; LeafType::COUNT],
}

impl Default for HostLayout {
    fn default() -> Self {
        let mut sizes = [0u8; LeafType::COUNT];
        let mut aligns = [0u8; LeafType::COUNT];
        for (i, (size, align)) in [
            (1, 1), // Bool8
            (1, 1), // Char8
            (2, 2), // Utf16
            (1, 1), // Int8
            (2, 2), // Int16
            (4, 4), // Int32
            (8, 8), // Int64
            (1, 1), // UInt8
            (2, 2), // UInt16
            (4, 4), // UInt32
            (8, 8), // UInt64
            (4, 4), // Real32
            (8, 8), // Real64
            (4, 4), // TimeDate32
            (8, 4), // TimeDate48: { u32 sec; u16 ticks; } padded
            (8, 4), // TimeDate64: { u32 sec; u32 usec; }
        ]
        .into_iter()
        .enumerate()
        {
            sizes[i] = size;
            aligns[i] = align;
        }
        HostLayout { sizes, aligns }
    }
}

impl HostLayout {
    /// Build a custom layout table.
    ///
    /// `sizes` and `aligns` are indexed by [`LeafType`] declaration
    /// order. Every alignment must be a power of two and no entry may be
    /// zero.
    pub fn new(sizes: [u8; 16], aligns: [u8; 16]) -> Result<Self> {
        for i in 0..LeafType::COUNT {
            if sizes[i] == 0 || aligns[i] == 0 || !aligns[i].is_power_of_two() {
                return Err(TrdpError::param(format!(
                    "bad host layout entry {i}: size {}, align {}",
                    sizes[i], aligns[i]
                )));
            }
        }
        Ok(HostLayout { sizes, aligns })
    }

    fn size(&self, ty: LeafType) -> usize {
        self.sizes[ty.index()] as usize
    }

    fn align(&self, ty: LeafType) -> usize {
        self.aligns[ty.index()] as usize
    }
}

/// Marshalling tables: ComId map, dataset descriptors, host layout.
#[derive(Debug, Clone)]
pub struct Marshalling {
    /// `(comId, datasetId)`, sorted by ComId.
    com_map: Vec<(u32, u32)>,
    /// Dataset descriptors, sorted by id.
    datasets: Vec<Dataset>,
    layout: HostLayout,
}

impl Marshalling {
    /// Load the tables, sorting them and rejecting duplicate ids,
    /// dangling dataset references and reference cycles.
    pub fn new(
        com_map: impl Into<Vec<(u32, u32)>>,
        datasets: impl Into<Vec<Dataset>>,
        layout: HostLayout,
    ) -> Result<Self> {
        let mut com_map = com_map.into();
        let mut datasets = datasets.into();
        com_map.sort_unstable();
        datasets.sort_unstable_by_key(|ds| ds.id);

        if com_map.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(TrdpError::param("duplicate ComId in marshalling map"));
        }
        if datasets.windows(2).any(|w| w[0].id == w[1].id) {
            return Err(TrdpError::param("duplicate dataset id"));
        }

        let this = Marshalling {
            com_map,
            datasets,
            layout,
        };
        for (com_id, ds_id) in &this.com_map {
            if this.dataset(*ds_id).is_err() {
                return Err(TrdpError::param(format!(
                    "ComId {com_id} maps to unknown dataset {ds_id}"
                )));
            }
        }
        for ds in &this.datasets {
            this.check_acyclic(ds, &mut Vec::new())?;
        }
        Ok(this)
    }

    fn check_acyclic(&self, ds: &Dataset, stack: &mut Vec<u32>) -> Result<()> {
        if stack.contains(&ds.id) {
            return Err(TrdpError::param(format!(
                "dataset reference cycle through dataset {}",
                ds.id
            )));
        }
        stack.push(ds.id);
        for elem in &ds.elements {
            if let ElemType::Dataset(ref_id) = elem.ty {
                self.check_acyclic(self.dataset(ref_id)?, stack)?;
            }
        }
        stack.pop();
        Ok(())
    }

    /// Look up the dataset bound to a ComId.
    pub fn dataset_for_com_id(&self, com_id: u32) -> Result<&Dataset> {
        let idx = self
            .com_map
            .binary_search_by_key(&com_id, |&(c, _)| c)
            .map_err(|_| TrdpError::ComId(com_id))?;
        self.dataset(self.com_map[idx].1)
    }

    /// Look up a dataset descriptor by id.
    pub fn dataset(&self, ds_id: u32) -> Result<&Dataset> {
        self.datasets
            .binary_search_by_key(&ds_id, |ds| ds.id)
            .map(|idx| &self.datasets[idx])
            .map_err(|_| TrdpError::param(format!("unknown dataset {ds_id}")))
    }

    /// Transform a host-layout dataset into wire layout. Returns the
    /// number of wire bytes produced.
    pub fn marshall(&self, com_id: u32, src: &[u8], dest: &mut [u8]) -> Result<usize> {
        let ds = self.dataset_for_com_id(com_id)?;
        self.to_wire(ds, src, Some(dest))
    }

    /// Transform a wire-layout dataset into host layout. Returns the
    /// number of host bytes produced.
    pub fn unmarshall(&self, com_id: u32, src: &[u8], dest: &mut [u8]) -> Result<usize> {
        let ds = self.dataset_for_com_id(com_id)?;
        self.from_wire(ds, src, Some(dest))
    }

    /// [`Self::marshall`] addressed by dataset id.
    pub fn marshall_dataset(&self, ds_id: u32, src: &[u8], dest: &mut [u8]) -> Result<usize> {
        self.to_wire(self.dataset(ds_id)?, src, Some(dest))
    }

    /// [`Self::unmarshall`] addressed by dataset id.
    pub fn unmarshall_dataset(&self, ds_id: u32, src: &[u8], dest: &mut [u8]) -> Result<usize> {
        self.from_wire(self.dataset(ds_id)?, src, Some(dest))
    }

    /// Wire size a host-layout dataset will marshall to. Senders size
    /// their frame buffers with this.
    pub fn wire_size(&self, com_id: u32, src: &[u8]) -> Result<usize> {
        let ds = self.dataset_for_com_id(com_id)?;
        self.to_wire(ds, src, None)
    }

    /// Host size a wire-layout dataset will unmarshall to. Receivers
    /// verify the advertised dataset length with this before copying.
    pub fn host_size(&self, com_id: u32, wire_src: &[u8]) -> Result<usize> {
        let ds = self.dataset_for_com_id(com_id)?;
        self.from_wire(ds, wire_src, None)
    }

    fn to_wire(&self, ds: &Dataset, src: &[u8], dest: Option<&mut [u8]>) -> Result<usize> {
        let mut host = Reader::new(src);
        let mut wire = Writer::new(dest);
        self.walk(ds, 1, Dir::ToWire, &mut host, &mut wire)?;
        Ok(wire.pos)
    }

    fn from_wire(&self, ds: &Dataset, src: &[u8], dest: Option<&mut [u8]>) -> Result<usize> {
        let mut wire = Reader::new(src);
        let mut host = Writer::new(dest);
        self.walk(ds, 1, Dir::FromWire, &mut wire, &mut host)?;
        Ok(host.pos)
    }

    /// Depth-first traversal shared by all four entry points. `reader`
    /// is the source (host for `ToWire`, wire for `FromWire`), `writer`
    /// the destination or a pure size counter.
    fn walk(
        &self,
        ds: &Dataset,
        depth: usize,
        dir: Dir,
        reader: &mut Reader<'_>,
        writer: &mut Writer<'_>,
    ) -> Result<()> {
        if depth > MAX_DS_DEPTH {
            return Err(TrdpError::param(format!(
                "dataset nesting exceeds {MAX_DS_DEPTH} levels at dataset {}",
                ds.id
            )));
        }
        for elem in &ds.elements {
            let n = match elem.count {
                0 => self.transfer_count(dir, reader, writer)? as u32,
                n => n,
            };
            match elem.ty {
                ElemType::Leaf(leaf) => {
                    for _ in 0..n {
                        self.transfer_leaf(leaf, dir, reader, writer)?;
                    }
                }
                ElemType::Dataset(ref_id) => {
                    let nested = self.dataset(ref_id)?;
                    for _ in 0..n {
                        self.walk(nested, depth + 1, dir, reader, writer)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Move a dynamic array count across, in either direction. The count
    /// is a `u16` on the wire and a host-layout `u16` in memory.
    fn transfer_count(
        &self,
        dir: Dir,
        reader: &mut Reader<'_>,
        writer: &mut Writer<'_>,
    ) -> Result<u16> {
        let (hsize, halign) = (
            self.layout.size(LeafType::UInt16),
            self.layout.align(LeafType::UInt16),
        );
        match dir {
            Dir::ToWire => {
                reader.align_to(halign);
                let n = read_host_scalar(reader.take(hsize)?) as u16;
                writer.put(&n.to_be_bytes())?;
                Ok(n)
            }
            Dir::FromWire => {
                let n = u16::from_be_bytes(reader.take(2)?.try_into().expect("two bytes"));
                writer.align_to(halign)?;
                writer.put_scalar(n as u64, hsize)?;
                Ok(n)
            }
        }
    }

    fn transfer_leaf(
        &self,
        leaf: LeafType,
        dir: Dir,
        reader: &mut Reader<'_>,
        writer: &mut Writer<'_>,
    ) -> Result<()> {
        match leaf {
            // Composite time types travel as their component scalars but
            // occupy one aligned struct in host memory.
            LeafType::TimeDate48 => {
                self.transfer_composite(leaf, &[LeafType::UInt32, LeafType::UInt16], dir, reader, writer)
            }
            LeafType::TimeDate64 => {
                self.transfer_composite(leaf, &[LeafType::UInt32, LeafType::UInt32], dir, reader, writer)
            }
            _ => self.transfer_scalar(leaf, dir, reader, writer),
        }
    }

    fn transfer_scalar(
        &self,
        leaf: LeafType,
        dir: Dir,
        reader: &mut Reader<'_>,
        writer: &mut Writer<'_>,
    ) -> Result<()> {
        let wsize = leaf.wire_size();
        let hsize = self.layout.size(leaf);
        let halign = self.layout.align(leaf);
        match dir {
            Dir::ToWire => {
                reader.align_to(halign);
                let val = read_host_scalar(reader.take(hsize)?);
                writer.put(&val.to_be_bytes()[8 - wsize..])?;
            }
            Dir::FromWire => {
                let mut raw = [0u8; 8];
                raw[8 - wsize..].copy_from_slice(reader.take(wsize)?);
                let mut val = u64::from_be_bytes(raw);
                if leaf.is_signed() && hsize > wsize {
                    val = sign_extend(val, wsize);
                }
                writer.align_to(halign)?;
                writer.put_scalar(val, hsize)?;
            }
        }
        Ok(())
    }

    fn transfer_composite(
        &self,
        leaf: LeafType,
        components: &[LeafType],
        dir: Dir,
        reader: &mut Reader<'_>,
        writer: &mut Writer<'_>,
    ) -> Result<()> {
        let ssize = self.layout.size(leaf);
        let salign = self.layout.align(leaf);
        match dir {
            Dir::ToWire => {
                reader.align_to(salign);
                let start = reader.pos;
                for &c in components {
                    self.transfer_scalar(c, dir, reader, writer)?;
                }
                reader.skip_to(start + ssize)?;
            }
            Dir::FromWire => {
                writer.align_to(salign)?;
                let start = writer.pos;
                for &c in components {
                    self.transfer_scalar(c, dir, reader, writer)?;
                }
                writer.pad_to(start + ssize)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    ToWire,
    FromWire,
}

/// Range-checked source cursor. Overruns are parameter errors: the
/// descriptor demands more data than the source holds.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn align_to(&mut self, align: usize) {
        self.pos = self.pos.div_ceil(align) * align;
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(TrdpError::param(format!(
                "source exhausted: need {len} bytes at offset {}, have {}",
                self.pos,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn skip_to(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(TrdpError::param(format!(
                "source exhausted: need offset {pos}, have {}",
                self.buf.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }
}

/// Range-checked destination cursor, or a pure size counter when
/// constructed without a buffer. Overruns are memory errors: the caller's
/// destination is too small.
struct Writer<'a> {
    buf: Option<&'a mut [u8]>,
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: Option<&'a mut [u8]>) -> Self {
        Writer { buf, pos: 0 }
    }

    fn check(&self, end: usize) -> Result<()> {
        if let Some(buf) = &self.buf {
            if end > buf.len() {
                return Err(TrdpError::Mem {
                    requested: end,
                    available: buf.len(),
                });
            }
        }
        Ok(())
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        self.check(end)?;
        if let Some(buf) = &mut self.buf {
            buf[self.pos..end].copy_from_slice(bytes);
        }
        self.pos = end;
        Ok(())
    }

    /// Write a scalar value as `size` native-endian bytes.
    fn put_scalar(&mut self, val: u64, size: usize) -> Result<()> {
        let bytes = val.to_ne_bytes();
        if cfg!(target_endian = "little") {
            self.put(&bytes[..size])
        } else {
            self.put(&bytes[8 - size..])
        }
    }

    /// Zero-fill up to an alignment boundary.
    fn align_to(&mut self, align: usize) -> Result<()> {
        self.pad_to(self.pos.div_ceil(align) * align)
    }

    /// Zero-fill up to an absolute offset.
    fn pad_to(&mut self, pos: usize) -> Result<()> {
        self.check(pos)?;
        if let Some(buf) = &mut self.buf {
            buf[self.pos..pos].fill(0);
        }
        self.pos = pos;
        Ok(())
    }
}

/// Interpret `size` native-endian bytes as an unsigned value.
fn read_host_scalar(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    if cfg!(target_endian = "little") {
        raw[..bytes.len()].copy_from_slice(bytes);
    } else {
        raw[8 - bytes.len()..].copy_from_slice(bytes);
    }
    u64::from_ne_bytes(raw)
}

fn sign_extend(val: u64, from_bytes: usize) -> u64 {
    let shift = 64 - from_bytes * 8;
    (((val << shift) as i64) >> shift) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Marshalling {
        // D1 = { u16, dynamic u8[], D2 }, D2 = { i32, f32[3] }
        let d1 = Dataset {
            id: 1,
            elements: vec![
                Element::scalar(LeafType::UInt16),
                Element::dynamic(LeafType::UInt8),
                Element::dataset(2, 1),
            ],
        };
        let d2 = Dataset {
            id: 2,
            elements: vec![
                Element::scalar(LeafType::Int32),
                Element::array(LeafType::Real32, 3),
            ],
        };
        Marshalling::new(vec![(1001, 1), (1002, 2)], vec![d1, d2], HostLayout::default())
            .unwrap()
    }

    /// Host-layout image of the nested reference value
    /// `(0x1234, [0xAA, 0xBB, 0xCC], (-1, [1.0, 2.0, 3.0]))`.
    fn host_image() -> Vec<u8> {
        let mut host = Vec::new();
        host.extend_from_slice(&0x1234u16.to_ne_bytes());
        host.extend_from_slice(&3u16.to_ne_bytes());
        host.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        host.push(0); // align i32
        host.extend_from_slice(&(-1i32).to_ne_bytes());
        for f in [1.0f32, 2.0, 3.0] {
            host.extend_from_slice(&f.to_ne_bytes());
        }
        host
    }

    const WIRE_IMAGE: &[u8] = &[
        0x12, 0x34, // u16
        0x00, 0x03, // dynamic count
        0xAA, 0xBB, 0xCC, // items
        0xFF, 0xFF, 0xFF, 0xFF, // -1i32
        0x3F, 0x80, 0x00, 0x00, // 1.0
        0x40, 0x00, 0x00, 0x00, // 2.0
        0x40, 0x40, 0x00, 0x00, // 3.0
    ];

    #[test]
    fn test_nested_marshall_byte_exact() {
        let m = tables();
        let host = host_image();
        let mut wire = vec![0u8; 64];
        let n = m.marshall(1001, &host, &mut wire).unwrap();
        assert_eq!(&wire[..n], WIRE_IMAGE);
    }

    #[test]
    fn test_nested_round_trip() {
        let m = tables();
        let host = host_image();
        let mut wire = vec![0u8; 64];
        let n = m.marshall(1001, &host, &mut wire).unwrap();
        let mut back = vec![0u8; host.len()];
        let h = m.unmarshall(1001, &wire[..n], &mut back).unwrap();
        assert_eq!(&back[..h], &host[..]);
    }

    #[test]
    fn test_size_computation_matches_marshall() {
        let m = tables();
        let host = host_image();
        assert_eq!(m.wire_size(1001, &host).unwrap(), WIRE_IMAGE.len());
        assert_eq!(m.host_size(1001, WIRE_IMAGE).unwrap(), host.len());
    }

    #[test]
    fn test_dynamic_count_zero_still_on_wire() {
        let m = Marshalling::new(
            vec![(10, 3)],
            vec![Dataset {
                id: 3,
                elements: vec![Element::dynamic(LeafType::UInt8)],
            }],
            HostLayout::default(),
        )
        .unwrap();
        let host = 0u16.to_ne_bytes();
        let mut wire = [0xFFu8; 4];
        let n = m.marshall(10, &host, &mut wire).unwrap();
        assert_eq!(&wire[..n], &[0x00, 0x00]);
    }

    #[test]
    fn test_unknown_com_id() {
        let m = tables();
        assert!(matches!(
            m.marshall(9999, &[], &mut []),
            Err(TrdpError::ComId(9999))
        ));
    }

    #[test]
    fn test_dangling_dataset_ref_rejected_at_init() {
        let err = Marshalling::new(
            vec![(1, 1)],
            vec![Dataset {
                id: 1,
                elements: vec![Element::dataset(77, 1)],
            }],
            HostLayout::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("77"));
    }

    #[test]
    fn test_cycle_rejected_at_init() {
        let a = Dataset {
            id: 1,
            elements: vec![Element::dataset(2, 1)],
        };
        let b = Dataset {
            id: 2,
            elements: vec![Element::dataset(1, 1)],
        };
        let err =
            Marshalling::new(vec![(1, 1)], vec![a, b], HostLayout::default()).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_depth_cap() {
        // A linear chain of nine datasets is acyclic but too deep.
        let mut datasets = Vec::new();
        for id in 1..=9u32 {
            let elements = if id < 9 {
                vec![Element::dataset(id + 1, 1)]
            } else {
                vec![Element::scalar(LeafType::UInt8)]
            };
            datasets.push(Dataset { id, elements });
        }
        let m = Marshalling::new(vec![(1, 1)], datasets, HostLayout::default()).unwrap();
        let err = m.marshall(1, &[0u8; 16], &mut [0u8; 16]).unwrap_err();
        assert!(err.to_string().contains("nesting"));
    }

    #[test]
    fn test_source_exhaustion_is_param_error() {
        let m = tables();
        // Dynamic count larger than the remaining source.
        let mut host = Vec::new();
        host.extend_from_slice(&0x1234u16.to_ne_bytes());
        host.extend_from_slice(&200u16.to_ne_bytes());
        host.extend_from_slice(&[0u8; 8]);
        let mut wire = [0u8; 512];
        assert!(matches!(
            m.marshall(1001, &host, &mut wire),
            Err(TrdpError::Param(_))
        ));
    }

    #[test]
    fn test_dest_exhaustion_is_mem_error() {
        let m = tables();
        let host = host_image();
        let mut wire = [0u8; 8];
        assert!(matches!(
            m.marshall(1001, &host, &mut wire),
            Err(TrdpError::Mem { .. })
        ));
    }

    #[test]
    fn test_sign_extension_on_widened_hosts() {
        // Every integer is four bytes in host memory, as on word-addressed
        // code generators.
        let mut sizes = [0u8; 16];
        let mut aligns = [0u8; 16];
        let natural = HostLayout::default();
        for i in 0..16 {
            sizes[i] = natural.sizes[i].max(4);
            aligns[i] = natural.aligns[i].max(4);
        }
        sizes[LeafType::Int64.index()] = 8;
        sizes[LeafType::UInt64.index()] = 8;
        sizes[LeafType::Real64.index()] = 8;
        sizes[LeafType::TimeDate48.index()] = 8;
        sizes[LeafType::TimeDate64.index()] = 8;
        let layout = HostLayout::new(sizes, aligns).unwrap();

        let m = Marshalling::new(
            vec![(5, 5)],
            vec![Dataset {
                id: 5,
                elements: vec![Element::scalar(LeafType::Int16)],
            }],
            layout,
        )
        .unwrap();

        // Host value -2 as a widened i32.
        let host = (-2i32).to_ne_bytes();
        let mut wire = [0u8; 2];
        let n = m.marshall_dataset(5, &host, &mut wire).unwrap();
        assert_eq!(&wire[..n], &[0xFF, 0xFE]);

        let mut back = [0u8; 4];
        let h = m.unmarshall_dataset(5, &wire, &mut back).unwrap();
        assert_eq!(h, 4);
        assert_eq!(i32::from_ne_bytes(back), -2);
    }

    #[test]
    fn test_timedate_composites() {
        let m = Marshalling::new(
            vec![(6, 6)],
            vec![Dataset {
                id: 6,
                elements: vec![
                    Element::scalar(LeafType::TimeDate48),
                    Element::scalar(LeafType::UInt8),
                ],
            }],
            HostLayout::default(),
        )
        .unwrap();

        let mut host = Vec::new();
        host.extend_from_slice(&0x0102_0304u32.to_ne_bytes());
        host.extend_from_slice(&0x0506u16.to_ne_bytes());
        host.extend_from_slice(&[0, 0]); // struct padding
        host.push(0x77);

        let mut wire = [0u8; 16];
        let n = m.marshall_dataset(6, &host, &mut wire).unwrap();
        // Components travel unpadded: 4 + 2 + 1 bytes.
        assert_eq!(&wire[..n], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x77]);

        let mut back = vec![0u8; host.len()];
        let h = m.unmarshall_dataset(6, &wire[..n], &mut back).unwrap();
        assert_eq!(&back[..h], &host[..]);
    }

    #[test]
    fn test_fixed_array_round_trip() {
        let m = tables();
        let mut host = Vec::new();
        host.extend_from_slice(&42i32.to_ne_bytes());
        for f in [0.5f32, -0.5, 1e9] {
            host.extend_from_slice(&f.to_ne_bytes());
        }
        let mut wire = [0u8; 16];
        let n = m.marshall(1002, &host, &mut wire).unwrap();
        assert_eq!(n, 16);
        let mut back = [0u8; 16];
        let h = m.unmarshall(1002, &wire, &mut back).unwrap();
        assert_eq!(&back[..h], &host[..]);
    }
}
