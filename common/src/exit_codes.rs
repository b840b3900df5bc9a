// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

/// Process exit codes for the node binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExitCode {
    #[error("Command line processing failed")]
    CommandLine = 1,
    #[error("Logging initialization failed")]
    Logging = 2,
    #[error("Network parameter initialization failed")]
    Params = 3,
    #[error("Storage initialization failed")]
    Storage = 4,
    #[error("DAG initialization failed")]
    Dag = 5,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_match_contract() {
        assert_eq!(ExitCode::CommandLine.as_i32(), 1);
        assert_eq!(ExitCode::Logging.as_i32(), 2);
        assert_eq!(ExitCode::Params.as_i32(), 3);
        assert_eq!(ExitCode::Storage.as_i32(), 4);
        assert_eq!(ExitCode::Dag.as_i32(), 5);
    }
}
