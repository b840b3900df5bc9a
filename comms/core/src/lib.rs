// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! The connection and message layer: length-prefixed CRC-protected frames, a scanning framer
//! state machine, serialize/deserialize worker pools and the peer connection registry.

mod connection;
mod connection_manager;
mod error;
mod framing;
mod pools;

pub use connection::{Connection, PeerId};
pub use connection_manager::{ConnectionManager, FrameHandler};
pub use error::CommsError;
pub use framing::{Frame, Framer, MessageHeader, HEADER_LENGTH, MAX_MESSAGE_LENGTH};
pub use pools::WorkerPool;
