// Copyright 2025 Sushanth (https://github.com/sushanthpy)
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

use anyhow::Result;
use clap::{Parser, Subcommand};
use dripway_server::{config::GatewayConfig, run_server, run_worker};

#[derive(Parser, Debug)]
#[command(author, version, about = "Rate-limited request-shaping gateway", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP ingress
    Serve,
    /// Run the drip worker (exactly one per store)
    Work,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    dripway_server::init_tracing();
    let config = GatewayConfig::from_env();

    match args.command {
        Command::Serve => run_server(config).await,
        Command::Work => run_worker(config).await,
    }
}
