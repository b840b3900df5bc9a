// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! The transaction model: outpoints, inputs, outputs, the transaction itself and the UTXO record,
//! plus the tiny stack-program listings attached to inputs and outputs.

pub mod tasm;

mod transaction;
mod utxo;

pub use tasm::{Listing, OpCode, Tasm};
pub use transaction::{Coin, Transaction, TxInput, TxOutPoint, TxOutput, UNCONNECTED};
pub use utxo::{compute_utxo_key, Utxo};
