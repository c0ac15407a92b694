//! Deterministic sharding of the note universe.
//!
//! Shards partition work across plan workers without overlap: the union
//! of all shards is the full set, and shards are pairwise disjoint.

use serde::{Deserialize, Serialize};

/// FNV-1a, 64-bit. Used for shard assignment and match signatures.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardBy {
    #[serde(rename = "noteId-hash")]
    NoteIdHash,
    #[serde(rename = "index-mod")]
    IndexMod,
}

impl Default for ShardBy {
    fn default() -> Self {
        ShardBy::NoteIdHash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub index: u64,
    pub count: u64,
    #[serde(default)]
    pub by: ShardBy,
}

impl ShardSpec {
    /// Whether this shard owns the note. `index-mod` shards must use
    /// `includes_index` instead.
    pub fn includes_note(&self, note_id: &str) -> bool {
        match self.by {
            ShardBy::NoteIdHash => {
                self.count > 0 && fnv1a64(note_id.as_bytes()) % self.count == self.index
            }
            ShardBy::IndexMod => true,
        }
    }

    /// Whether this shard owns the list position (for `index-mod` shards).
    pub fn includes_index(&self, list_index: u64) -> bool {
        match self.by {
            ShardBy::IndexMod => self.count > 0 && list_index % self.count == self.index,
            ShardBy::NoteIdHash => true,
        }
    }

    /// Filter a note list by both rules.
    pub fn filter<'a>(&self, note_ids: &'a [String]) -> Vec<&'a String> {
        note_ids
            .iter()
            .enumerate()
            .filter(|(i, id)| self.includes_note(id) && self.includes_index(*i as u64))
            .map(|(_, id)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a64_known_values() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    fn note_ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{:024x}", i * 7919)).collect()
    }

    #[test]
    fn test_shards_partition_the_universe() {
        let ids = note_ids(100);
        let shards: Vec<ShardSpec> = (0..4)
            .map(|index| ShardSpec {
                index,
                count: 4,
                by: ShardBy::NoteIdHash,
            })
            .collect();

        let mut total = 0;
        for shard in &shards {
            let subset = shard.filter(&ids);
            // A hash shard of 100 over 4 stays within [20, 30].
            assert!(
                (20..=30).contains(&subset.len()),
                "shard {} got {} notes",
                shard.index,
                subset.len()
            );
            total += subset.len();
        }
        assert_eq!(total, 100);

        // Disjointness: each id is owned by exactly one shard.
        for id in &ids {
            let owners = shards.iter().filter(|s| s.includes_note(id)).count();
            assert_eq!(owners, 1);
        }
    }

    #[test]
    fn test_index_mod_shard() {
        let ids = note_ids(10);
        let shard = ShardSpec {
            index: 1,
            count: 2,
            by: ShardBy::IndexMod,
        };
        let subset = shard.filter(&ids);
        assert_eq!(subset.len(), 5);
        assert_eq!(subset[0], &ids[1]);
        assert_eq!(subset[4], &ids[9]);
    }

    #[test]
    fn test_shard_serde_names() {
        let spec: ShardSpec =
            serde_json::from_str(r#"{"index": 2, "count": 4, "by": "noteId-hash"}"#).unwrap();
        assert_eq!(spec.by, ShardBy::NoteIdHash);
        let spec: ShardSpec =
            serde_json::from_str(r#"{"index": 0, "count": 2, "by": "index-mod"}"#).unwrap();
        assert_eq!(spec.by, ShardBy::IndexMod);
        // `by` defaults to the hash rule.
        let spec: ShardSpec = serde_json::from_str(r#"{"index": 0, "count": 2}"#).unwrap();
        assert_eq!(spec.by, ShardBy::NoteIdHash);
    }

    #[test]
    fn test_same_note_always_lands_in_same_shard() {
        let shard = ShardSpec {
            index: 2,
            count: 4,
            by: ShardBy::NoteIdHash,
        };
        let id = "65f2a8b90000000012034abc";
        assert_eq!(shard.includes_note(id), shard.includes_note(id));
    }
}
