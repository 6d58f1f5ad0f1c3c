use ingest_relay::modules::ingest::transcoder;
use ingest_relay::{RelayServer, RelaySettings};
use log::{error, info};
use tokio::sync::broadcast;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let settings = RelaySettings::from_env()?;

    // Refuse to start without a working transcoder
    let program = &settings.session.transcode.program;
    match transcoder::probe(program).await {
        Ok(version) => info!("Using transcoder {}: {}", program, version),
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    }

    let server = RelayServer::new(&settings)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                let _ = shutdown_tx.send(());
            }
            Err(e) => {
                // Keep serving without a signal handler
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    server.run_with_shutdown(shutdown_rx).await?;
    info!("Server stopped");
    Ok(())
}
