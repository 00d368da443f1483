use replis::config::Config;
use replis::error::ServerResult;
use replis::replication::{Role, replica};
use replis::server::{ServerContext, run_server};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> ServerResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::from_args(&args);
    let ctx = ServerContext::new(config);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down on ctrl-c");
                cancel.cancel();
            }
        });
    }

    if ctx.repl.role == Role::Replica {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = replica::run_replica_link(ctx, cancel).await {
                warn!("replica link ended: {e}");
            }
        });
    }

    run_server(ctx, cancel).await?;
    Ok(())
}
