// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection is no longer valid")]
    ConnectionInvalid,
    #[error("The connection manager is not running")]
    NotRunning,
    #[error("Peer {0} is not connected")]
    UnknownPeer(String),
    #[error("Frame exceeds the maximum message length: {0} bytes")]
    OversizedFrame(usize),
}
