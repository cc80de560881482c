//! netkv server daemon: exposes any registered backend over the netkv
//! protocol.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use store::backend::netkv::NetKvServer;

/// CLI arguments for the netkv daemon.
#[derive(Parser, Debug)]
#[command(about = "Serves a key-value backend over the netkv protocol")]
struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    listen: String,

    /// Backend DSN, e.g. `slate:///var/data/kv` or `memory://local`.
    dsn: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let kv = store::open(&args.dsn).await?;

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(listen = %args.listen, dsn = %args.dsn, "starting netkv server");
    NetKvServer::new(kv).serve(listener).await?;
    Ok(())
}
