use crate::config::RelayConfig;
use crate::error::Result;
use crate::relay::server::RelayServer;
use std::future::Future;
use tracing::info;

/// Serves the session relay until `shutdown` resolves.
pub async fn serve<F>(config: RelayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let server = RelayServer::bind(config).await?;
    for (name, id) in server.relay().directory() {
        info!(%name, session = %id, "named session");
    }
    server.run(shutdown).await
}
