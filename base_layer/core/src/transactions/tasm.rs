// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! The listing VM: a four-opcode stack program over a flat witness/predicate data blob.
//!
//! An output listing carries the predicate program (typically a single `VERIFY` or `MULTISIG`)
//! and its static data; an input listing supplies the witness data. At validation time the
//! programs run over the input data followed by the output data.

use std::collections::HashSet;

use epic_common::get_params;
use epic_common_types::{Address, Hash, PublicKey};
use log::*;

use crate::codec::{ByteReader, CodecError, Decodable, Encodable, WriteExt};

const LOG_TARGET: &str = "c::tx::tasm";

/// VM opcodes. One byte each in the program stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Fail = 0,
    Success = 1,
    Verify = 2,
    Multisig = 3,
}

impl OpCode {
    pub fn from_byte(b: u8) -> Option<OpCode> {
        match b {
            0 => Some(OpCode::Fail),
            1 => Some(OpCode::Success),
            2 => Some(OpCode::Verify),
            3 => Some(OpCode::Multisig),
            _ => None,
        }
    }
}

/// A program plus its data blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub program: Vec<u8>,
    pub data: Vec<u8>,
}

impl Listing {
    pub fn new(program: Vec<u8>, data: Vec<u8>) -> Self {
        Self { program, data }
    }

    /// A listing with data only (the usual shape of an input witness).
    pub fn from_data(data: Vec<u8>) -> Self {
        Self {
            program: Vec::new(),
            data,
        }
    }

    /// The canonical single-key predicate: `VERIFY` with the encoded address as data.
    pub fn pay_to_address(addr: &Address) -> Self {
        let encoded = addr.encode(get_params().pubkey_address_prefix);
        let mut data = Vec::new();
        data.put_sized_bytes(encoded.as_bytes());
        Self {
            program: vec![OpCode::Verify as u8],
            data,
        }
    }

    /// The witness consumed by `VERIFY`: public key, DER signature and the signed message hash.
    pub fn witness(pubkey: &PublicKey, sig_der: &[u8], msg_hash: &Hash) -> Self {
        let mut data = Vec::new();
        data.put_sized_bytes(&pubkey.serialize());
        data.put_sized_bytes(sig_der);
        data.put_hash(msg_hash);
        Self {
            program: Vec::new(),
            data,
        }
    }

    pub fn encoded_size(&self) -> usize {
        use crate::codec::size_of_compact_size;
        size_of_compact_size(self.program.len() as u64)
            + self.program.len()
            + size_of_compact_size(self.data.len() as u64)
            + self.data.len()
    }
}

impl Encodable for Listing {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_sized_bytes(&self.program);
        buf.put_sized_bytes(&self.data);
    }
}

impl Decodable for Listing {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let program = reader.read_sized_bytes()?;
        let data = reader.read_sized_bytes()?;
        Ok(Self { program, data })
    }
}

/// The listing interpreter.
pub struct Tasm;

impl Tasm {
    /// Run the predicate program of `output` over the concatenated witness data of `input`
    /// followed by the output's own data. Returns true iff execution ends in SUCCESS.
    pub fn verify_in_out(input: &Listing, output: &Listing) -> bool {
        let mut data = Vec::with_capacity(input.data.len() + output.data.len());
        data.extend_from_slice(&input.data);
        data.extend_from_slice(&output.data);
        let mut program = output.program.clone();
        program.extend_from_slice(&input.program);
        Self::exec(&Listing { program, data })
    }

    /// Execute a listing. Opcodes run in order; any failing opcode or malformed data terminates
    /// with FAIL. An exhausted program counts as SUCCESS.
    pub fn exec(listing: &Listing) -> bool {
        let mut reader = ByteReader::new(&listing.data);
        for &byte in &listing.program {
            let op = match OpCode::from_byte(byte) {
                Some(op) => op,
                None => {
                    debug!(target: LOG_TARGET, "Unknown opcode {:#04x}", byte);
                    return false;
                },
            };
            match op {
                OpCode::Fail => return false,
                OpCode::Success => return true,
                OpCode::Verify => {
                    if !exec_verify(&mut reader) {
                        return false;
                    }
                },
                OpCode::Multisig => {
                    if !exec_multisig(&mut reader) {
                        return false;
                    }
                },
            }
        }
        true
    }
}

fn exec_verify(reader: &mut ByteReader<'_>) -> bool {
    let parsed = (|| -> Result<(Vec<u8>, Vec<u8>, Hash, Vec<u8>), CodecError> {
        let pubkey = reader.read_sized_bytes()?;
        let sig = reader.read_sized_bytes()?;
        let msg = reader.read_hash()?;
        let addr = reader.read_sized_bytes()?;
        Ok((pubkey, sig, msg, addr))
    })();
    let (pubkey_bytes, sig, msg, addr_bytes) = match parsed {
        Ok(v) => v,
        Err(_) => return false,
    };

    let pubkey = match PublicKey::from_slice(&pubkey_bytes) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let encoded = match String::from_utf8(addr_bytes) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let addr = match Address::decode(&encoded, get_params().pubkey_address_prefix) {
        Ok(a) => a,
        Err(_) => return false,
    };
    if pubkey.to_address() != addr {
        return false;
    }
    pubkey.verify(&msg, &sig)
}

fn exec_multisig(reader: &mut ByteReader<'_>) -> bool {
    // (pubkey, sig, msg) triples, then m, then the address set
    let parsed = (|| -> Result<_, CodecError> {
        let n = reader.read_compact_size()? as usize;
        let mut triples = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            let pubkey = reader.read_sized_bytes()?;
            let sig = reader.read_sized_bytes()?;
            let msg = reader.read_hash()?;
            triples.push((pubkey, sig, msg));
        }
        let m = reader.read_u8()?;
        let n_addr = reader.read_compact_size()? as usize;
        let mut addrs = Vec::with_capacity(n_addr.min(64));
        for _ in 0..n_addr {
            addrs.push(reader.read_sized_bytes()?);
        }
        Ok((triples, m, addrs))
    })();
    let (triples, m, encoded_addrs) = match parsed {
        Ok(v) => v,
        Err(_) => return false,
    };

    if triples.len() != m as usize {
        return false;
    }

    let prefix = get_params().pubkey_address_prefix;
    let mut allowed = HashSet::with_capacity(encoded_addrs.len());
    for bytes in encoded_addrs {
        let encoded = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => return false,
        };
        match Address::decode(&encoded, prefix) {
            Ok(a) => allowed.insert(a),
            Err(_) => return false,
        };
    }

    let mut signers = HashSet::with_capacity(triples.len());
    for (pubkey_bytes, sig, msg) in triples {
        let pubkey = match PublicKey::from_slice(&pubkey_bytes) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let addr = pubkey.to_address();
        if !allowed.contains(&addr) {
            return false;
        }
        // each allowed key may sign at most once
        if !signers.insert(addr) {
            return false;
        }
        if !pubkey.verify(&msg, &sig) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod test {
    use epic_common_types::PrivateKey;

    use super::*;

    fn keyed_witness(msg: &Hash) -> (PrivateKey, Listing) {
        let key = PrivateKey::random();
        let sig = key.sign(msg).unwrap();
        let listing = Listing::witness(&key.public_key(), &sig, msg);
        (key, listing)
    }

    #[test]
    fn trivial_programs() {
        assert!(Tasm::exec(&Listing::new(vec![OpCode::Success as u8], vec![])));
        assert!(!Tasm::exec(&Listing::new(vec![OpCode::Fail as u8], vec![])));
        // empty program is vacuous success
        assert!(Tasm::exec(&Listing::default()));
        // unknown opcode fails
        assert!(!Tasm::exec(&Listing::new(vec![0x7f], vec![])));
    }

    #[test]
    fn verify_accepts_matching_key() {
        let msg = Hash::sha256(b"spend");
        let (key, witness) = keyed_witness(&msg);
        let predicate = Listing::pay_to_address(&key.public_key().to_address());
        assert!(Tasm::verify_in_out(&witness, &predicate));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let msg = Hash::sha256(b"spend");
        let (_key, witness) = keyed_witness(&msg);
        let other = PrivateKey::random();
        let predicate = Listing::pay_to_address(&other.public_key().to_address());
        assert!(!Tasm::verify_in_out(&witness, &predicate));
    }

    #[test]
    fn verify_rejects_bad_signature() {
        let msg = Hash::sha256(b"spend");
        let key = PrivateKey::random();
        let sig = key.sign(&Hash::sha256(b"other")).unwrap();
        let witness = Listing::witness(&key.public_key(), &sig, &msg);
        let predicate = Listing::pay_to_address(&key.public_key().to_address());
        assert!(!Tasm::verify_in_out(&witness, &predicate));
    }

    #[test]
    fn verify_rejects_truncated_witness() {
        let key = PrivateKey::random();
        let predicate = Listing::pay_to_address(&key.public_key().to_address());
        let witness = Listing::from_data(vec![0x02, 0xAA]);
        assert!(!Tasm::verify_in_out(&witness, &predicate));
    }

    #[test]
    fn multisig_two_of_three() {
        let msg = Hash::sha256(b"multi");
        let keys: Vec<_> = (0..3).map(|_| PrivateKey::random()).collect();
        let prefix = get_params().pubkey_address_prefix;

        let mut data = Vec::new();
        data.put_compact_size(2);
        for key in keys.iter().take(2) {
            let sig = key.sign(&msg).unwrap();
            data.put_sized_bytes(&key.public_key().serialize());
            data.put_sized_bytes(&sig);
            data.put_hash(&msg);
        }
        data.put_u8(2);
        data.put_compact_size(3);
        for key in &keys {
            let encoded = key.public_key().to_address().encode(prefix);
            data.put_sized_bytes(encoded.as_bytes());
        }
        assert!(Tasm::exec(&Listing::new(vec![OpCode::Multisig as u8], data)));
    }

    #[test]
    fn multisig_rejects_duplicate_signer() {
        let msg = Hash::sha256(b"multi");
        let key = PrivateKey::random();
        let prefix = get_params().pubkey_address_prefix;
        let sig = key.sign(&msg).unwrap();

        let mut data = Vec::new();
        data.put_compact_size(2);
        for _ in 0..2 {
            data.put_sized_bytes(&key.public_key().serialize());
            data.put_sized_bytes(&sig);
            data.put_hash(&msg);
        }
        data.put_u8(2);
        data.put_compact_size(1);
        let encoded = key.public_key().to_address().encode(prefix);
        data.put_sized_bytes(encoded.as_bytes());
        assert!(!Tasm::exec(&Listing::new(vec![OpCode::Multisig as u8], data)));
    }

    #[test]
    fn listing_codec_round_trip() {
        let listing = Listing::new(vec![OpCode::Verify as u8], vec![1, 2, 3]);
        let encoded = listing.encode();
        assert_eq!(encoded.len(), listing.encoded_size());
        assert_eq!(Listing::decode_exact(&encoded).unwrap(), listing);
    }
}
