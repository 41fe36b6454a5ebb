// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable for psu-updater: keeps PSU firmware at the latest version

use camino::Utf8PathBuf;
use clap::Parser;
use psu_updater::{run_updater, Config};

#[derive(Debug, Parser)]
#[clap(name = "psu-updater", about = "PSU firmware update service")]
enum Args {
    /// Start the updater
    Run {
        #[clap(name = "CONFIG_FILE_PATH", action)]
        config_file_path: Utf8PathBuf,
    },
}

fn fatal(message: String) -> ! {
    eprintln!("psu-updater: {message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    if let Err(message) = do_run().await {
        fatal(message);
    }
}

async fn do_run() -> Result<(), String> {
    let args = Args::parse();

    match args {
        Args::Run { config_file_path } => {
            let config = Config::from_file(&config_file_path).map_err(|e| {
                format!(
                    "failed to parse {}: {}",
                    config_file_path,
                    display_error_chain::DisplayErrorChain::new(&e)
                )
            })?;
            let log = config
                .log
                .to_logger("psu-updater")
                .map_err(|msg| format!("initializing logger: {}", msg))?;
            run_updater(config, log).await
        }
    }
}
