use anyhow::{Error, Result};
use notification_consumer::{config::Config, utils::init_tracing, worker::run_worker};
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(&config);

    if let Err(e) = run_worker(config).await {
        error!(error = %e, "Notification consumer exited with error");
        return Err(e);
    }

    Ok(())
}
