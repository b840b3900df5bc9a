// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use super::blake2b_256;

/// Edges are generated in blocks of 64: every SipHash output in a block is XORed with the last
/// one before use.
pub const EDGE_BLOCK_BITS: u32 = 6;
pub const EDGE_BLOCK_SIZE: u64 = 1 << EDGE_BLOCK_BITS;
pub const EDGE_BLOCK_MASK: u64 = EDGE_BLOCK_SIZE - 1;

/// A quadruple of 64-bit SipHash keys derived from the block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SipHashKeys {
    pub k0: u64,
    pub k1: u64,
    pub k2: u64,
    pub k3: u64,
}

impl SipHashKeys {
    /// Interpret 32 bytes as four little-endian keys.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let word = |i: usize| u64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().expect("8 bytes"));
        Self {
            k0: word(0),
            k1: word(1),
            k2: word(2),
            k3: word(3),
        }
    }

    pub fn siphash24(&self, nonce: u64) -> u64 {
        let mut state = SipHashState::new(self);
        state.hash24(nonce);
        state.xor_lanes()
    }
}

/// Keys for the graph defined by a block header (pre-proof bytes): BLAKE2b-256 of the header.
pub fn siphash_keys_from_header(header_bytes: &[u8]) -> SipHashKeys {
    let digest = blake2b_256(header_bytes);
    SipHashKeys::from_bytes(digest.as_bytes())
}

/// SipHash-2-4 state with the cuckaroo rotation constant 21 in the final lane rotate.
pub struct SipHashState {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

const ROT_E: u32 = 21;

impl SipHashState {
    pub fn new(keys: &SipHashKeys) -> Self {
        Self {
            v0: keys.k0,
            v1: keys.k1,
            v2: keys.k2,
            v3: keys.k3,
        }
    }

    pub fn xor_lanes(&self) -> u64 {
        (self.v0 ^ self.v1) ^ (self.v2 ^ self.v3)
    }

    fn sip_round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v1 = self.v1.rotate_left(13);
        self.v3 = self.v3.rotate_left(16);
        self.v1 ^= self.v0;
        self.v3 ^= self.v2;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v1 = self.v1.rotate_left(17);
        self.v3 = self.v3.rotate_left(ROT_E);
        self.v1 ^= self.v2;
        self.v3 ^= self.v0;
        self.v2 = self.v2.rotate_left(32);
    }

    pub fn hash24(&mut self, nonce: u64) {
        self.v3 ^= nonce;
        self.sip_round();
        self.sip_round();
        self.v0 ^= nonce;
        self.v2 ^= 0xff;
        for _ in 0..4 {
            self.sip_round();
        }
    }
}

/// Compute the edge value for `edge` by running SipHash over its containing block of 64 edge
/// indices and XORing every output with the last. Returns the value for the requested edge.
pub fn sip_block(keys: &SipHashKeys, edge: u64, buf: &mut [u64; EDGE_BLOCK_SIZE as usize]) -> u64 {
    let mut state = SipHashState::new(keys);
    let edge0 = edge & !EDGE_BLOCK_MASK;
    for (i, slot) in buf.iter_mut().enumerate() {
        state.hash24(edge0 + i as u64);
        *slot = state.xor_lanes();
    }
    let last = buf[EDGE_BLOCK_MASK as usize];
    for slot in buf.iter_mut().take(EDGE_BLOCK_MASK as usize) {
        *slot ^= last;
    }
    buf[(edge & EDGE_BLOCK_MASK) as usize]
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_keys() -> SipHashKeys {
        siphash_keys_from_header(b"epic test header")
    }

    #[test]
    fn keys_from_header_are_deterministic() {
        assert_eq!(test_keys(), test_keys());
        assert_ne!(test_keys(), siphash_keys_from_header(b"another header"));
    }

    #[test]
    fn sip_block_matches_across_block_members() {
        // every edge in one 64-block sees the same buffer contents
        let keys = test_keys();
        let mut buf_a = [0u64; EDGE_BLOCK_SIZE as usize];
        let mut buf_b = [0u64; EDGE_BLOCK_SIZE as usize];
        let a = sip_block(&keys, 130, &mut buf_a);
        let b = sip_block(&keys, 131, &mut buf_b);
        assert_eq!(buf_a, buf_b);
        assert_eq!(a, buf_a[130 & EDGE_BLOCK_MASK as usize]);
        assert_eq!(b, buf_b[131 & EDGE_BLOCK_MASK as usize]);
    }

    #[test]
    fn last_edge_in_block_is_unmasked() {
        let keys = test_keys();
        let mut buf = [0u64; EDGE_BLOCK_SIZE as usize];
        let value = sip_block(&keys, EDGE_BLOCK_MASK, &mut buf);
        // the last slot is XORed with itself only notionally; it keeps its raw value
        assert_eq!(value, buf[EDGE_BLOCK_MASK as usize]);
    }
}
