use clap::Parser;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;

use gridstore::config::Config;
use gridstore::db::PgDatabase;
use gridstore::GridStore;

mod cli;

use cli::commands::handle_cli;
use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let mut cfg = Config::from_env()?;
    if let Some(bucket) = args.bucket {
        cfg.grid.bucket_name = bucket;
    }

    if let Some(port) = cfg.prometheus_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()?;
        info!("Prometheus metrics on port {}", port);
    }

    let db = PgDatabase::connect(&cfg.database_url).await?;
    info!("Database OK.");

    let store = GridStore::initialize(&db, cfg.grid.clone()).await?;
    handle_cli(args.command, &store).await
}
