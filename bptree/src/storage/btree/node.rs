//! Node layout and tagged slot encoding.
//!
//! Every node is an 8-byte header followed by `len` 64-bit little-endian
//! signed slots.
//!
//! Header layout:
//! - `node_type`: 1 byte
//! - `flags`: 1 byte (bit 0 set when slots may hold refs)
//! - `reserved`: 2 bytes
//! - `len`: 4 bytes (number of slots)
//!
//! Inner node slots:
//! - slot 0: tagged `elems_per_child` (compact form), or a ref to an offsets
//!   node (general form)
//! - slots 1..=k: child refs
//! - slot k+1: tagged `total_elems_in_tree`
//!
//! Refs are always even, so a tagged count `1 + 2*v` (always odd) can share a
//! slot position with a ref. Slots are decoded into [`Slot`] before use; the
//! parity test lives only in [`Slot::decode`].

// Slot values are i64 on disk, counts and refs are u64 in memory.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

use crate::storage::arena::{Allocator, NodeSource, Ref};
use crate::storage::btree::tree::TreeError;

/// Size of a node header in bytes.
pub const NODE_HEADER_SIZE: usize = 8;

/// Size of one node slot in bytes.
pub const SLOT_SIZE: usize = 8;

/// Header flag: slots may contain refs that must be followed on destruction.
pub const FLAG_HAS_REFS: u8 = 0x01;

/// Node type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    /// Leaf payload, interpreted by the leaf type.
    Leaf = 0x01,
    /// Inner B+-tree node.
    Inner = 0x02,
    /// Cumulative child sizes of a general-form inner node.
    Offsets = 0x03,
}

impl TryFrom<u8> for NodeType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Leaf),
            0x02 => Ok(Self::Inner),
            0x03 => Ok(Self::Offsets),
            _ => Err(value),
        }
    }
}

/// Header information for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub node_type: NodeType,
    pub flags: u8,
    pub len: u32,
}

impl NodeHeader {
    /// Create a header with the default flags for `node_type`.
    #[must_use]
    pub const fn new(node_type: NodeType, len: u32) -> Self {
        let flags = match node_type {
            NodeType::Inner => FLAG_HAS_REFS,
            NodeType::Leaf | NodeType::Offsets => 0,
        };
        Self {
            node_type,
            flags,
            len,
        }
    }

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; NODE_HEADER_SIZE] {
        let mut buf = [0u8; NODE_HEADER_SIZE];
        buf[0] = self.node_type as u8;
        buf[1] = self.flags;
        // bytes 2-3 reserved
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    /// Deserialize a header from the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NodeError> {
        if bytes.len() < NODE_HEADER_SIZE {
            return Err(NodeError::InvalidHeader);
        }
        let node_type = NodeType::try_from(bytes[0]).map_err(|_| NodeError::InvalidHeader)?;
        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let header = Self {
            node_type,
            flags: bytes[1],
            len,
        };
        if bytes.len() < header.byte_size() {
            return Err(NodeError::InvalidHeader);
        }
        Ok(header)
    }

    /// Whether the slots of this node may hold refs.
    #[must_use]
    pub const fn has_refs(self) -> bool {
        self.flags & FLAG_HAS_REFS != 0
    }

    /// Serialized size of the node (header and slots).
    #[must_use]
    pub const fn byte_size(self) -> usize {
        NODE_HEADER_SIZE + self.len as usize * SLOT_SIZE
    }
}

/// Largest count a tagged immediate can hold.
pub const MAX_COUNT: u64 = (i64::MAX as u64 - 1) / 2;

/// Encode `v` as a tagged immediate: `1 + 2*v`.
///
/// `v` must not exceed [`MAX_COUNT`].
#[must_use]
pub const fn encode_count(v: u64) -> i64 {
    debug_assert!(v <= MAX_COUNT, "count does not fit in a tagged slot");
    1 + 2 * v as i64
}

/// Decode a tagged immediate. Returns `None` unless `x` is odd and positive.
#[must_use]
pub const fn decode_count(x: i64) -> Option<u64> {
    if x > 0 && x % 2 != 0 {
        Some(((x - 1) / 2) as u64)
    } else {
        None
    }
}

/// Whether a raw slot value holds a ref.
#[must_use]
pub const fn is_ref(x: i64) -> bool {
    x % 2 == 0
}

/// A decoded inner-node slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Ref(Ref),
    Count(u64),
}

impl Slot {
    /// Encode the slot into its raw form.
    #[must_use]
    pub const fn encode(self) -> i64 {
        match self {
            Self::Ref(r) => r as i64,
            Self::Count(v) => encode_count(v),
        }
    }

    /// Decode a raw slot value.
    ///
    /// Negative values and the null ref are corruption.
    pub fn decode(raw: i64) -> Result<Self, NodeError> {
        if raw <= 0 {
            return Err(NodeError::CorruptSlot(raw));
        }
        if is_ref(raw) {
            Ok(Self::Ref(raw as Ref))
        } else {
            decode_count(raw)
                .map(Self::Count)
                .ok_or(NodeError::CorruptSlot(raw))
        }
    }
}

/// Serialize a node into a fresh byte buffer.
#[must_use]
pub fn encode_node(node_type: NodeType, slots: &[i64]) -> Vec<u8> {
    let header = NodeHeader::new(node_type, slots.len() as u32);
    let mut bytes = Vec::with_capacity(header.byte_size());
    bytes.extend_from_slice(&header.to_bytes());
    for slot in slots {
        bytes.extend_from_slice(&slot.to_le_bytes());
    }
    bytes
}

/// Read the header of the node at `node_ref`.
pub fn read_header<S: NodeSource + ?Sized>(src: &S, node_ref: Ref) -> Result<NodeHeader, TreeError> {
    let bytes = src.node_bytes(node_ref)?;
    Ok(NodeHeader::from_bytes(bytes)?)
}

/// Read the header and all slots of the node at `node_ref`.
pub fn read_slots<S: NodeSource + ?Sized>(
    src: &S,
    node_ref: Ref,
) -> Result<(NodeHeader, Vec<i64>), TreeError> {
    let bytes = src.node_bytes(node_ref)?;
    let header = NodeHeader::from_bytes(bytes)?;
    let slots = bytes[NODE_HEADER_SIZE..header.byte_size()]
        .chunks_exact(SLOT_SIZE)
        .map(|chunk| {
            let mut raw = [0u8; SLOT_SIZE];
            raw.copy_from_slice(chunk);
            i64::from_le_bytes(raw)
        })
        .collect();
    Ok((header, slots))
}

/// Read a single slot of the node at `node_ref`.
pub fn read_slot<S: NodeSource + ?Sized>(src: &S, node_ref: Ref, ndx: usize) -> Result<i64, TreeError> {
    let bytes = src.node_bytes(node_ref)?;
    let header = NodeHeader::from_bytes(bytes)?;
    if ndx >= header.len as usize {
        return Err(TreeError::IndexOutOfBounds {
            index: ndx as u64,
            size: u64::from(header.len),
        });
    }
    let offset = NODE_HEADER_SIZE + ndx * SLOT_SIZE;
    let mut raw = [0u8; SLOT_SIZE];
    raw.copy_from_slice(&bytes[offset..offset + SLOT_SIZE]);
    Ok(i64::from_le_bytes(raw))
}

/// Allocate a node in `arena` and fill it with `slots`.
pub fn create_node<A: Allocator + ?Sized>(
    arena: &mut A,
    node_type: NodeType,
    slots: &[i64],
) -> Result<Ref, TreeError> {
    let bytes = encode_node(node_type, slots);
    let node_ref = arena.allocate(bytes.len())?;
    match arena.node_bytes_mut(node_ref) {
        Ok(block) => {
            block[..bytes.len()].copy_from_slice(&bytes);
            Ok(node_ref)
        }
        Err(e) => {
            arena.free(node_ref);
            Err(e.into())
        }
    }
}

/// Overwrite the node at `node_ref` in place, keeping its identity.
pub fn write_node<A: Allocator + ?Sized>(
    arena: &mut A,
    node_ref: Ref,
    node_type: NodeType,
    slots: &[i64],
) -> Result<(), TreeError> {
    let bytes = encode_node(node_type, slots);
    let block = arena.node_bytes_mut(node_ref)?;
    if bytes.len() > block.len() {
        return Err(NodeError::NodeFull.into());
    }
    block[..bytes.len()].copy_from_slice(&bytes);
    Ok(())
}

/// Free the node at `node_ref` and everything reachable from it.
///
/// Unreadable nodes are skipped; there is nothing left to recover from them.
pub fn destroy_deep<A: Allocator + ?Sized>(arena: &mut A, node_ref: Ref) {
    let (header, slots) = match read_slots(&*arena, node_ref) {
        Ok(node) => node,
        Err(e) => {
            tracing::warn!("Skipping destruction of unreadable node {}: {}", node_ref, e);
            return;
        }
    };
    if header.has_refs() {
        for raw in slots {
            if let Ok(Slot::Ref(child)) = Slot::decode(raw) {
                destroy_deep(arena, child);
            }
        }
    }
    arena.free(node_ref);
}

/// Read the cumulative sizes stored in an offsets node.
pub fn read_offsets<S: NodeSource + ?Sized>(src: &S, offsets_ref: Ref) -> Result<Vec<u64>, TreeError> {
    let (header, slots) = read_slots(src, offsets_ref)?;
    if header.node_type != NodeType::Offsets {
        return Err(NodeError::WrongNodeType.into());
    }
    slots
        .into_iter()
        .map(|raw| u64::try_from(raw).map_err(|_| NodeError::CorruptSlot(raw).into()))
        .collect()
}

/// Encode cumulative sizes as offsets node slots.
#[must_use]
pub fn offsets_slots(offsets: &[u64]) -> Vec<i64> {
    offsets.iter().map(|&o| o as i64).collect()
}

/// Cumulative sizes for a general-form node: one entry per child except the last.
#[must_use]
pub fn cumulative_offsets(child_sizes: &[u64]) -> Vec<u64> {
    child_sizes
        .iter()
        .take(child_sizes.len().saturating_sub(1))
        .scan(0u64, |acc, &size| {
            *acc += size;
            Some(*acc)
        })
        .collect()
}

/// Inner node form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeForm {
    /// All children but the last hold exactly `elems_per_child` elements.
    Compact { elems_per_child: u64 },
    /// Child sizes are recorded in a separate offsets node.
    General { offsets: Ref },
}

/// A decoded inner node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerNode {
    pub form: NodeForm,
    /// Child refs, in element order.
    pub children: Vec<Ref>,
    /// Total number of elements below this node.
    pub total: u64,
}

impl InnerNode {
    /// Decode an inner node from its raw slots.
    pub fn from_slots(slots: &[i64]) -> Result<Self, NodeError> {
        let [first, middle @ .., last] = slots else {
            return Err(NodeError::InvalidHeader);
        };
        if middle.is_empty() {
            return Err(NodeError::InvalidHeader);
        }

        let form = match Slot::decode(*first)? {
            Slot::Count(elems_per_child) => NodeForm::Compact { elems_per_child },
            Slot::Ref(offsets) => NodeForm::General { offsets },
        };
        let children = middle
            .iter()
            .map(|&raw| match Slot::decode(raw)? {
                Slot::Ref(child) => Ok(child),
                Slot::Count(_) => Err(NodeError::CorruptSlot(raw)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let Slot::Count(total) = Slot::decode(*last)? else {
            return Err(NodeError::CorruptSlot(*last));
        };

        Ok(Self {
            form,
            children,
            total,
        })
    }

    /// Encode the node into raw slots.
    #[must_use]
    pub fn to_slots(&self) -> Vec<i64> {
        let first = match self.form {
            NodeForm::Compact { elems_per_child } => Slot::Count(elems_per_child),
            NodeForm::General { offsets } => Slot::Ref(offsets),
        };
        let mut slots = Vec::with_capacity(self.children.len() + 2);
        slots.push(first.encode());
        slots.extend(self.children.iter().map(|&c| Slot::Ref(c).encode()));
        slots.push(Slot::Count(self.total).encode());
        slots
    }

    /// Read the inner node at `node_ref`.
    pub fn read<S: NodeSource + ?Sized>(src: &S, node_ref: Ref) -> Result<Self, TreeError> {
        let (header, slots) = read_slots(src, node_ref)?;
        if header.node_type != NodeType::Inner {
            return Err(NodeError::WrongNodeType.into());
        }
        Ok(Self::from_slots(&slots)?)
    }

    /// Allocate a new node holding this inner node.
    pub fn create<A: Allocator + ?Sized>(&self, arena: &mut A) -> Result<Ref, TreeError> {
        create_node(arena, NodeType::Inner, &self.to_slots())
    }

    /// Overwrite the node at `node_ref` with this inner node.
    pub fn write<A: Allocator + ?Sized>(&self, arena: &mut A, node_ref: Ref) -> Result<(), TreeError> {
        write_node(arena, node_ref, NodeType::Inner, &self.to_slots())
    }

    #[must_use]
    pub const fn is_compact(&self) -> bool {
        matches!(self.form, NodeForm::Compact { .. })
    }

    /// Element count of every child, in order.
    pub fn child_sizes<S: NodeSource + ?Sized>(&self, src: &S) -> Result<Vec<u64>, TreeError> {
        let count = self.children.len();
        let sizes = match self.form {
            NodeForm::Compact { elems_per_child } => {
                let full = elems_per_child * (count as u64 - 1);
                let last = self
                    .total
                    .checked_sub(full)
                    .ok_or(NodeError::CorruptSlot(encode_count(self.total)))?;
                let mut sizes = vec![elems_per_child; count - 1];
                sizes.push(last);
                sizes
            }
            NodeForm::General { offsets } => {
                let offsets = read_offsets(src, offsets)?;
                if offsets.len() + 1 != count {
                    return Err(NodeError::WrongNodeType.into());
                }
                let mut prev = 0u64;
                let mut sizes = Vec::with_capacity(count);
                for &o in offsets.iter().chain(std::iter::once(&self.total)) {
                    let size = o
                        .checked_sub(prev)
                        .ok_or(NodeError::CorruptSlot(o as i64))?;
                    sizes.push(size);
                    prev = o;
                }
                sizes
            }
        };
        Ok(sizes)
    }

    /// Locate the child holding element `ndx`.
    ///
    /// Returns the child index and the element index within that child.
    pub fn find_child<S: NodeSource + ?Sized>(&self, src: &S, ndx: u64) -> Result<(usize, u64), TreeError> {
        if ndx >= self.total {
            return Err(TreeError::IndexOutOfBounds {
                index: ndx,
                size: self.total,
            });
        }
        match self.form {
            NodeForm::Compact { elems_per_child: 0 } => Err(NodeError::CorruptSlot(encode_count(0)).into()),
            NodeForm::Compact { elems_per_child } => {
                let child = (ndx / elems_per_child) as usize;
                if child >= self.children.len() {
                    return Err(NodeError::CorruptSlot(encode_count(elems_per_child)).into());
                }
                Ok((child, ndx % elems_per_child))
            }
            NodeForm::General { offsets } => {
                let offsets = read_offsets(src, offsets)?;
                let child = offsets.partition_point(|&o| o <= ndx);
                let start = if child == 0 { 0 } else { offsets[child - 1] };
                Ok((child, ndx - start))
            }
        }
    }
}

/// Errors that can occur when decoding nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Invalid or truncated node header.
    InvalidHeader,
    /// Wrong node type for operation.
    WrongNodeType,
    /// A slot holds a value that is neither a valid ref nor a tagged count.
    CorruptSlot(i64),
    /// The node does not fit in its block.
    NodeFull,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidHeader => write!(f, "invalid node header"),
            Self::WrongNodeType => write!(f, "wrong node type for operation"),
            Self::CorruptSlot(raw) => write!(f, "corrupt node slot: {raw}"),
            Self::NodeFull => write!(f, "node is full"),
        }
    }
}

impl std::error::Error for NodeError {}
