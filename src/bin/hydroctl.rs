/*
  hydroctl, an environmental control runtime for hydroponic installations.
  Copyright (C) 2024 the hydroctl developers.

  hydroctl is free software: you can redistribute it and/or modify
  it under the terms of the GNU General Public License as published by
  the Free Software Foundation, either version 3 of the License, or
  (at your option) any later version.

  hydroctl is distributed in the hope that it will be useful,
  but WITHOUT ANY WARRANTY; without even the implied warranty of
  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
  GNU General Public License for more details.

  You should have received a copy of the GNU General Public License
  along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! The `hydroctl` executable.
//!
//! One command: `run`. Environment overrides:
//!
//! * `HYDROCTL_CONFIG` — path of the configuration JSON
//!   (default `/etc/hydroctl/config.json`);
//! * `HYDROCTL_HTTP_ADDR` — bind address handed to the HTTP front end;
//! * `HYDROCTL_DRY_RUN=1` (or the `--dry-run` flag) — replace the board
//!   with the deterministic simulator.

use std::{fs::File, io::BufReader, process::ExitCode, sync::Arc};

use log::{error, info};

use hydroctl::{
    clock::SystemClock,
    config::RuntimeConfig,
    hardware::{Board, Platform, Simulator},
    runtime::Runtime,
};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let dry_run = args.iter().any(|a| a == "--dry-run")
        || std::env::var("HYDROCTL_DRY_RUN").is_ok_and(|v| v == "1");
    let command = args.iter().find(|a| !a.starts_with("--"));
    if command.map(String::as_str) != Some("run") {
        eprintln!("usage: hydroctl run [--dry-run]");
        return ExitCode::FAILURE;
    }

    match run(dry_run) {
        Ok(fatal) => {
            if fatal {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("hydroctl failed to start: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(dry_run: bool) -> Result<bool, hydroctl::Error> {
    let config_path = std::env::var("HYDROCTL_CONFIG")
        .unwrap_or_else(|_| "/etc/hydroctl/config.json".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let file = File::open(&config_path)?;
        let config = RuntimeConfig::parse(&mut BufReader::new(file))?;
        info!("loaded configuration from {config_path}");
        config
    } else if dry_run {
        let data_dir = std::env::var("HYDROCTL_DATA_DIR")
            .unwrap_or_else(|_| "./hydroctl-data".into());
        info!("no configuration at {config_path}, using the dry-run defaults");
        RuntimeConfig::simulated(data_dir.into())
    } else {
        error!("no configuration at {config_path}");
        return Err(hydroctl::Error::Config(
            hydroctl::config::ConfigError::Invalid(format!(
                "configuration file {config_path} not found"
            )),
        ));
    };

    if let Ok(addr) = std::env::var("HYDROCTL_HTTP_ADDR") {
        // consumed by the external HTTP layer; recorded here for the log
        info!("HTTP front end will bind {addr}");
    }

    let platform: Box<dyn Platform> = if dry_run {
        info!("dry run: outputs and probes are simulated");
        Box::new(Simulator::new())
    } else {
        Box::new(Board::open(&config.gpio_chip, config.onewire_dir.clone())?)
    };

    let runtime = Arc::new(Runtime::new(config, platform, Arc::new(SystemClock))?);

    // secure the pumps before unwinding takes the process down
    let failsafe = Arc::clone(&runtime);
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let _ = failsafe.panic_off();
        default_panic(panic_info);
    }));

    runtime.start()?;
    info!("hydroctl running");
    let fatal = runtime.join();
    runtime.stop()?;
    Ok(fatal)
}
