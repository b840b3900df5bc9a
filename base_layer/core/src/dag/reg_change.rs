// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::collections::HashSet;

use epic_common_types::Hash;

use crate::codec::{ByteReader, CodecError, Decodable, Encodable, WriteExt};

/// The delta of peer-chain heads across one milestone: `(peer_chain_head, last_registration)`
/// pairs created and removed. Applying the change advances the registration index; reverting it
/// restores the previous state exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegChange {
    created: HashSet<(Hash, Hash)>,
    removed: HashSet<(Hash, Hash)>,
}

impl RegChange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `head` now carries `last_reg` as its latest registration.
    pub fn create(&mut self, head: Hash, last_reg: Hash) {
        self.created.insert((head, last_reg));
    }

    /// Record that the pair `(head, last_reg)` is superseded.
    pub fn remove(&mut self, head: Hash, last_reg: Hash) {
        self.removed.insert((head, last_reg));
    }

    pub fn created(&self) -> &HashSet<(Hash, Hash)> {
        &self.created
    }

    pub fn removed(&self) -> &HashSet<(Hash, Hash)> {
        &self.removed
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty()
    }

    /// The change that undoes this one.
    pub fn inverted(&self) -> RegChange {
        RegChange {
            created: self.removed.clone(),
            removed: self.created.clone(),
        }
    }
}

impl Encodable for RegChange {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut write_set = |set: &HashSet<(Hash, Hash)>| {
            // sets are serialized sorted so the encoding is deterministic
            let mut pairs: Vec<_> = set.iter().collect();
            pairs.sort();
            buf.put_compact_size(pairs.len() as u64);
            for (head, reg) in pairs {
                buf.put_hash(head);
                buf.put_hash(reg);
            }
        };
        write_set(&self.created);
        write_set(&self.removed);
    }
}

impl Decodable for RegChange {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let mut read_set = |reader: &mut ByteReader<'_>| -> Result<HashSet<(Hash, Hash)>, CodecError> {
            let len = reader.read_compact_size()? as usize;
            let mut set = HashSet::with_capacity(len.min(1024));
            for _ in 0..len {
                set.insert((reader.read_hash()?, reader.read_hash()?));
            }
            Ok(set)
        };
        Ok(Self {
            created: read_set(reader)?,
            removed: read_set(reader)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invert_swaps_sets() {
        let mut change = RegChange::new();
        change.create(Hash::sha256(b"head"), Hash::sha256(b"new reg"));
        change.remove(Hash::sha256(b"head"), Hash::sha256(b"old reg"));

        let inverse = change.inverted();
        assert_eq!(inverse.created(), change.removed());
        assert_eq!(inverse.removed(), change.created());
        assert_eq!(inverse.inverted(), change);
    }

    #[test]
    fn codec_round_trip_is_order_independent() {
        let mut change = RegChange::new();
        for i in 0u8..5 {
            change.create(Hash::sha256(&[i]), Hash::sha256(&[i, i]));
        }
        let decoded = RegChange::decode_exact(&change.encode()).unwrap();
        assert_eq!(decoded, change);
    }
}
