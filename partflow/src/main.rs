use std::error::Error;

use tracing::{error, info};

mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    // Setup the CryptoProvider (controls core cryptography used by rustls) for the process
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Installing default CryptoProvider");

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = partflow_core::config::Settings::load()
        .map_err(|e| format!("Error loading configuration: {e:?}"))?;
    partflow_core::run(settings)
        .await
        .map_err(|e| format!("Error running event processor: {e:?}"))?;
    Ok(())
}
