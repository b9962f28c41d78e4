// Copyright 2025 bgpcore Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bgpcore::config::Config;
use bgpcore::log::LogLevel;
use bgpcore::server::BgpServer;
use bgpcore::{error, info};
use clap::Parser;

#[derive(Parser)]
#[command(name = "bgpcored")]
#[command(about = "BGP speaker daemon", version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::from_file(&args.config).unwrap_or_else(|e| {
        error!("failed to load config", "path" => &args.config, "error" => e.to_string());
        info!("using default configuration");
        Config::default()
    });

    match LogLevel::from_str(&config.log_level) {
        Ok(level) => bgpcore::log::set_level(level),
        Err(e) => error!("invalid log level in config", "error" => e),
    }

    info!("starting BGP daemon",
        "listen_addr" => &config.listen_addr,
        "peers" => config.peers.len());

    let server = BgpServer::new(config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("BGP server error", "error" => e.to_string());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
