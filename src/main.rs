/// dagloop server entry point
///
/// Reads configuration from `DAGLOOP_*` environment variables and serves:
/// - Webhook triggers at /webhook/{workflow_id}
/// - Execution, loop and approval APIs under /api
/// - Health check at /healthz

use dagloop::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::default();
    start_server(config).await
}
