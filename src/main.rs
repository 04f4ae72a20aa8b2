// Copyright 2026 Daniel Pelikan
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

//! HM-10 Link console application

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hm10_link::bluetooth::{BluezAdapter, RadioAdapter, Session};
use hm10_link::config::Config;
use hm10_link::console;
use hm10_link::events::SessionDriver;
use hm10_link::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first, it carries the default log filter
    let config = Config::load()?;

    // Initialize logging, RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hm10_link=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("Starting HM-10 Link v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {:?}", Config::path());

    // Open the radio
    let (radio_tx, radio_rx) = tokio::sync::mpsc::unbounded_channel();
    let radio: Arc<dyn RadioAdapter> =
        match BluezAdapter::new(config.bluetooth.adapter.as_deref(), radio_tx.clone()).await {
            Ok(adapter) => Arc::new(adapter),
            Err(e) => {
                error!("Bluetooth adapter unavailable: {}", e);
                Arc::new(BluezAdapter::unavailable(
                    BluezAdapter::power_state_for(&e),
                    radio_tx,
                ))
            }
        };

    // Create application state and session driver
    let state = AppState::new();
    let session = Session::new(radio, config.session_options());
    let (driver, handle) = SessionDriver::new(session, state.clone());
    let driver = driver.with_connect_timeout(config.connect_timeout());
    let driver_task = tokio::spawn(driver.run(radio_rx));

    info!("Ready. Type 'help' for commands.");

    tokio::select! {
        result = console::run(handle.clone(), state.clone()) => {
            if let Err(e) = result {
                warn!("Console stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    handle.shutdown();
    if let Err(e) = driver_task.await {
        error!("Session driver failed: {}", e);
    }

    info!("HM-10 Link stopped");
    Ok(())
}
