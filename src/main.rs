/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use alpha::{Cli, Engine, EngineCommand};
use anyhow::{Context, Result};
use clap::Parser;

fn main() {
    env_logger::init();

    if let Err(e) = start() {
        eprintln!("{} encountered an error: {e:#}", env!("CARGO_PKG_NAME"));
        std::process::exit(1);
    }
}

fn start() -> Result<()> {
    let cli = Cli::parse();
    let mut engine = Engine::from_cli(&cli)?;

    // A command given on the command line runs before any input is read
    if !cli.command.is_empty() {
        let input = cli.command.join(" ");
        let cmd = input
            .parse::<EngineCommand>()
            .with_context(|| format!("Invalid startup command {input:?}"))?;
        engine.send_command(cmd)?;
    }

    engine.run()
}
