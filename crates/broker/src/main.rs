// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use agent_relay::config::Config;
use agent_relay::lock::AlreadyRunning;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    let broker = match agent_relay::run::prepare(config).await {
        Ok(broker) => broker,
        Err(e) => {
            if e.downcast_ref::<AlreadyRunning>().is_some() {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
            error!("fatal: {e:#}");
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    };

    match broker.run(tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(result) => std::process::exit(result.exit_code),
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(3);
        }
    }
}
