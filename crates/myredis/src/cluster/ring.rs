//! Consistent-hash ring over a static node set.
//!
//! Each physical node contributes `vnodes` virtual positions, hashed as
//! CRC32/IEEE of `"<addr>#<i>"`. A key belongs to the owner of the first
//! position at or above its own CRC32, wrapping to the smallest position.
//! Membership never changes for the life of the process, so the position
//! vector is sorted once at construction.

use std::collections::HashMap;

pub const DEFAULT_VNODES: usize = 160;

pub struct Ring {
    positions: Vec<u32>,
    owners: HashMap<u32, String>,
}

impl Ring {
    pub fn new(nodes: &[String], vnodes: usize) -> Ring {
        let vnodes = if vnodes == 0 { DEFAULT_VNODES } else { vnodes };
        let mut positions = Vec::with_capacity(nodes.len() * vnodes);
        let mut owners = HashMap::with_capacity(nodes.len() * vnodes);
        for node in nodes {
            for i in 0..vnodes {
                let h = crc32fast::hash(format!("{node}#{i}").as_bytes());
                positions.push(h);
                owners.insert(h, node.clone());
            }
        }
        positions.sort_unstable();
        Ring { positions, owners }
    }

    /// Owner of `key`, or `None` for an empty ring.
    pub fn node_for_key(&self, key: &[u8]) -> Option<&str> {
        if self.positions.is_empty() {
            return None;
        }
        let h = crc32fast::hash(key);
        let idx = self.positions.partition_point(|&p| p < h);
        let pos = if idx == self.positions.len() {
            self.positions[0]
        } else {
            self.positions[idx]
        };
        self.owners.get(&pos).map(String::as_str)
    }
}
