use anyhow::Result;
use log::error;
use tokio::sync::broadcast;

use rct_bridge::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();

    // Create a channel for shutdown signaling
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl+C
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        if let Err(e) = shutdown_tx.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    });

    if let Err(e) = rct_bridge::app(shutdown_rx, options).await {
        // logging may not be up yet if the config failed to load
        eprintln!("Application error: {:?}", e);
        std::process::exit(255);
    }

    Ok(())
}
