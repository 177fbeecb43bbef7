use std::collections::HashMap;

use super::Rid;

/// In memory form of the `.kd` file: primary key -> base rid, and the
/// block start index of every base and tail rid.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyDirectory {
    key_to_base_rid: HashMap<u64, Rid>,
    base_rid_to_block: HashMap<Rid, u64>,
    tail_rid_to_block: HashMap<Rid, u64>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_maps(
        key_to_base_rid: HashMap<u64, Rid>,
        base_rid_to_block: HashMap<Rid, u64>,
        tail_rid_to_block: HashMap<Rid, u64>,
    ) -> Self {
        KeyDirectory {
            key_to_base_rid,
            base_rid_to_block,
            tail_rid_to_block,
        }
    }

    pub fn base_rid(&self, key: u64) -> Option<Rid> {
        self.key_to_base_rid.get(&key).copied()
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.key_to_base_rid.contains_key(&key)
    }

    pub fn base_block(&self, rid: Rid) -> Option<u64> {
        self.base_rid_to_block.get(&rid).copied()
    }

    pub fn tail_block(&self, rid: Rid) -> Option<u64> {
        self.tail_rid_to_block.get(&rid).copied()
    }

    pub fn insert_base(&mut self, key: u64, rid: Rid, block_start: u64) {
        self.key_to_base_rid.insert(key, rid);
        self.base_rid_to_block.insert(rid, block_start);
    }

    // The rid keeps its block so later members of its group still find it
    pub fn remove_key(&mut self, key: u64) -> Option<Rid> {
        self.key_to_base_rid.remove(&key)
    }

    pub fn insert_tail(&mut self, rid: Rid, block_start: u64) {
        self.tail_rid_to_block.insert(rid, block_start);
    }

    /// Only merge moves a base rid, and only for rids it already knows about.
    pub fn relocate_base(&mut self, rid: Rid, block_start: u64) -> bool {
        match self.base_rid_to_block.get_mut(&rid) {
            Some(block) => {
                *block = block_start;
                true
            }
            None => false,
        }
    }

    pub fn num_keys(&self) -> usize {
        self.key_to_base_rid.len()
    }

    pub fn num_tails(&self) -> usize {
        self.tail_rid_to_block.len()
    }

    pub fn key_to_base_rid(&self) -> &HashMap<u64, Rid> {
        &self.key_to_base_rid
    }

    pub fn base_rid_to_block(&self) -> &HashMap<Rid, u64> {
        &self.base_rid_to_block
    }

    pub fn tail_rid_to_block(&self) -> &HashMap<Rid, u64> {
        &self.tail_rid_to_block
    }
}
