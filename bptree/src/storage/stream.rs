//! Append-only output streams for serialized nodes.
//!
//! The subtree writer emits nodes into an [`OutputStream`]. Every append
//! returns the ref at which the bytes now live, so inner nodes written later
//! can point at children written earlier.
//!
//! Refs handed out by a stream follow the arena rules: they are 8-byte
//! aligned and never 0 (the first 8 bytes of a stream are reserved).

use crate::storage::arena::{ArenaError, NodeSource, REF_ALIGNMENT, Ref};
use crate::storage::btree::NodeHeader;

/// A sink for serialized nodes.
pub trait OutputStream {
    /// Append `bytes` and return the ref of their first byte.
    fn append(&mut self, bytes: &[u8]) -> Ref;
}

/// An output stream backed by a growable in-memory buffer.
#[derive(Debug, Clone)]
pub struct MemoryOutputStream {
    buffer: Vec<u8>,
}

impl MemoryOutputStream {
    /// Create an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; REF_ALIGNMENT],
        }
    }

    /// Total length of the stream in bytes, including the reserved prefix.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if nothing has been appended yet.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn is_empty(&self) -> bool {
        self.buffer.len() == REF_ALIGNMENT
    }

    /// Get the raw stream contents.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// CRC32 of everything appended so far (the reserved prefix is excluded).
    #[must_use]
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.buffer[REF_ALIGNMENT..]);
        hasher.finalize()
    }

    /// Freeze the stream into a readable image.
    #[must_use]
    pub fn into_image(self) -> ByteImage {
        ByteImage {
            bytes: self.buffer,
        }
    }
}

impl Default for MemoryOutputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStream for MemoryOutputStream {
    fn append(&mut self, bytes: &[u8]) -> Ref {
        let node_ref = self.buffer.len() as Ref;
        self.buffer.extend_from_slice(bytes);
        let padded = self.buffer.len().next_multiple_of(REF_ALIGNMENT);
        self.buffer.resize(padded, 0);
        node_ref
    }
}

impl NodeSource for MemoryOutputStream {
    fn node_bytes(&self, node_ref: Ref) -> Result<&[u8], ArenaError> {
        node_slice(&self.buffer, node_ref)
    }
}

/// A read-only image of serialized nodes, such as a finished output stream.
#[derive(Debug, Clone)]
pub struct ByteImage {
    bytes: Vec<u8>,
}

impl ByteImage {
    /// Wrap raw bytes laid out like an output stream.
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Get the raw image contents.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl NodeSource for ByteImage {
    fn node_bytes(&self, node_ref: Ref) -> Result<&[u8], ArenaError> {
        node_slice(&self.bytes, node_ref)
    }
}

/// Slice out the node at `node_ref`, bounded by the size in its header.
#[allow(clippy::cast_possible_truncation)]
fn node_slice(bytes: &[u8], node_ref: Ref) -> Result<&[u8], ArenaError> {
    let start = node_ref as usize;
    if node_ref == 0 || start % REF_ALIGNMENT != 0 || start >= bytes.len() {
        return Err(ArenaError::InvalidRef(node_ref));
    }
    let header = NodeHeader::from_bytes(&bytes[start..]).map_err(|_| ArenaError::InvalidRef(node_ref))?;
    bytes
        .get(start..start + header.byte_size())
        .ok_or(ArenaError::InvalidRef(node_ref))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::{NodeType, encode_node, read_slots};

    #[test]
    fn test_append_returns_aligned_refs() {
        let mut out = MemoryOutputStream::new();
        assert!(out.is_empty());

        let first = out.append(&encode_node(NodeType::Leaf, &[1, 2, 3]));
        let second = out.append(&[0xAB; 3]);
        let third = out.append(&encode_node(NodeType::Leaf, &[]));

        assert_eq!(first, 8);
        assert_eq!(second, 8 + 8 + 24);
        assert_eq!(third % 8, 0);
        assert!(third > second);
        assert!(!out.is_empty());
    }

    #[test]
    fn test_read_back_nodes() {
        let mut out = MemoryOutputStream::new();
        let leaf = out.append(&encode_node(NodeType::Leaf, &[10, 20]));
        let offsets = out.append(&encode_node(NodeType::Offsets, &[2]));

        let (header, slots) = read_slots(&out, leaf).expect("read leaf");
        assert_eq!(header.node_type, NodeType::Leaf);
        assert_eq!(slots, vec![10, 20]);

        let image = out.into_image();
        let (header, slots) = read_slots(&image, offsets).expect("read offsets");
        assert_eq!(header.node_type, NodeType::Offsets);
        assert_eq!(slots, vec![2]);
    }

    #[test]
    fn test_invalid_refs() {
        let mut out = MemoryOutputStream::new();
        let leaf = out.append(&encode_node(NodeType::Leaf, &[1]));

        assert_eq!(out.node_bytes(0), Err(ArenaError::InvalidRef(0)));
        assert_eq!(out.node_bytes(leaf + 4), Err(ArenaError::InvalidRef(leaf + 4)));
        assert_eq!(out.node_bytes(4096), Err(ArenaError::InvalidRef(4096)));
    }

    #[test]
    fn test_checksum_tracks_contents() {
        let mut a = MemoryOutputStream::new();
        let mut b = MemoryOutputStream::new();
        assert_eq!(a.checksum(), b.checksum());

        a.append(&encode_node(NodeType::Leaf, &[1]));
        b.append(&encode_node(NodeType::Leaf, &[2]));
        assert_ne!(a.checksum(), b.checksum());

        let image = ByteImage::from_bytes(a.as_bytes().to_vec());
        assert_eq!(image.as_bytes(), a.as_bytes());
    }
}
