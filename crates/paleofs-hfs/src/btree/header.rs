//! The B*-tree header record (spec §4.4): root node id, first/last leaf,
//! depth, record count, free-node count, stored as record 0 of node 0.
//! Record 1 of node 0 holds the start of the node-occupancy bitmap, which
//! continues into `Map` nodes linked forward from the header node when the
//! tree grows past the header's embedded capacity.

use crate::btree::node::NODE_SIZE;

const HEADER_RECORD_LEN: usize = 106;
/// Bytes of bitmap embedded directly in the header node (rest of the
/// 512-byte node after the 106-byte header record and its own overhead).
const HEADER_BITMAP_BYTES: usize = NODE_SIZE - 14 /* descriptor */ - HEADER_RECORD_LEN - 6 /* offsets */;

#[derive(Debug, Clone, Copy)]
pub struct BTreeHeader {
    pub depth: u16,
    pub root_node: u32,
    pub leaf_record_count: u32,
    pub first_leaf: u32,
    pub last_leaf: u32,
    pub node_size: u16,
    pub max_key_len: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub clump_size: u32,
    pub btree_type: u8,
}

impl BTreeHeader {
    pub fn new(max_key_len: u16, total_nodes: u32) -> Self {
        Self {
            depth: 0,
            root_node: 0,
            leaf_record_count: 0,
            first_leaf: 0,
            last_leaf: 0,
            node_size: NODE_SIZE as u16,
            max_key_len,
            total_nodes,
            // Node 0 (the header node) is always in use.
            free_nodes: total_nodes.saturating_sub(1),
            clump_size: 0,
            btree_type: 0,
        }
    }

    pub fn parse(record: &[u8]) -> Self {
        let mut r = [0u8; HEADER_RECORD_LEN];
        r[..record.len().min(HEADER_RECORD_LEN)]
            .copy_from_slice(&record[..record.len().min(HEADER_RECORD_LEN)]);
        Self {
            depth: u16::from_be_bytes(r[0..2].try_into().unwrap()),
            root_node: u32::from_be_bytes(r[2..6].try_into().unwrap()),
            leaf_record_count: u32::from_be_bytes(r[6..10].try_into().unwrap()),
            first_leaf: u32::from_be_bytes(r[10..14].try_into().unwrap()),
            last_leaf: u32::from_be_bytes(r[14..18].try_into().unwrap()),
            node_size: u16::from_be_bytes(r[18..20].try_into().unwrap()),
            max_key_len: u16::from_be_bytes(r[20..22].try_into().unwrap()),
            total_nodes: u32::from_be_bytes(r[22..26].try_into().unwrap()),
            free_nodes: u32::from_be_bytes(r[26..30].try_into().unwrap()),
            clump_size: u32::from_be_bytes(r[36..40].try_into().unwrap()),
            btree_type: r[40],
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut r = vec![0u8; HEADER_RECORD_LEN];
        r[0..2].copy_from_slice(&self.depth.to_be_bytes());
        r[2..6].copy_from_slice(&self.root_node.to_be_bytes());
        r[6..10].copy_from_slice(&self.leaf_record_count.to_be_bytes());
        r[10..14].copy_from_slice(&self.first_leaf.to_be_bytes());
        r[14..18].copy_from_slice(&self.last_leaf.to_be_bytes());
        r[18..20].copy_from_slice(&self.node_size.to_be_bytes());
        r[20..22].copy_from_slice(&self.max_key_len.to_be_bytes());
        r[22..26].copy_from_slice(&self.total_nodes.to_be_bytes());
        r[26..30].copy_from_slice(&self.free_nodes.to_be_bytes());
        r[36..40].copy_from_slice(&self.clump_size.to_be_bytes());
        r[40] = self.btree_type;
        r
    }

    pub fn embedded_bitmap_bytes() -> usize {
        HEADER_BITMAP_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let header = BTreeHeader {
            depth: 2,
            root_node: 5,
            leaf_record_count: 10,
            first_leaf: 3,
            last_leaf: 4,
            node_size: 512,
            max_key_len: 37,
            total_nodes: 64,
            free_nodes: 40,
            clump_size: 4096,
            btree_type: 0,
        };
        let bytes = header.serialize();
        let parsed = BTreeHeader::parse(&bytes);
        assert_eq!(parsed.root_node, 5);
        assert_eq!(parsed.max_key_len, 37);
    }
}
