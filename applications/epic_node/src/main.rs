// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::process;

use epic_common::{ExitCode, NetworkType, NodeConfig};
use log::{error, info, LevelFilter};

mod node;

const LOG_TARGET: &str = "epic::app";

fn main() {
    let config = match parse_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(ExitCode::CommandLine.as_i32());
        },
    };

    if init_logging().is_err() {
        eprintln!("failed to initialize logging");
        process::exit(ExitCode::Logging.as_i32());
    }

    info!(target: LOG_TARGET, "Starting epic node on {}", config.network);
    match node::run(config) {
        Ok(()) => {},
        Err(code) => {
            error!(target: LOG_TARGET, "Node exited with {}", code);
            process::exit(code.as_i32());
        },
    }
}

/// Host-level argument handling is intentionally thin: network name, optional data directory and
/// a mining switch.
fn parse_args() -> Result<NodeConfig, String> {
    let mut config = NodeConfig::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--network" => {
                let value = args.next().ok_or("--network requires a value")?;
                config.network = match value.as_str() {
                    "mainnet" => NetworkType::Mainnet,
                    "testnet" => NetworkType::Testnet,
                    "localnet" => NetworkType::Localnet,
                    other => return Err(format!("unknown network '{}'", other)),
                };
            },
            "--data-dir" => {
                let value = args.next().ok_or("--data-dir requires a value")?;
                config.storage.data_dir = value.into();
            },
            "--bind" => {
                config.comms.bind_address = args.next().ok_or("--bind requires a value")?;
            },
            "--mine" => {
                config.miner.solver_threads = config.miner.solver_threads.max(1);
            },
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }
    Ok(config)
}

fn init_logging() -> Result<(), anyhow::Error> {
    use log4rs::{
        append::console::ConsoleAppender,
        config::{Appender, Config, Root},
        encode::pattern::PatternEncoder,
    };

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S)} [{t}] {h({l})} {m}{n}")))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}
