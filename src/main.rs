use anyhow::Result;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use s3d::config::AppConfig;
use s3d::handlers::{self, AppState};
use s3d::services::blob_store::BlobStore;
use s3d::services::meta_store::MetaStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!(
        data_root = %cfg.data_root.display(),
        host_id = %cfg.host_id,
        credentials = cfg.credentials.len(),
        "starting s3d"
    );

    tokio::fs::create_dir_all(&cfg.data_root).await?;
    let store = BlobStore::open(cfg.buckets_dir()).await?;
    let db = MetaStore::open(cfg.meta_path()).await?;

    let state = AppState::new(
        db,
        store,
        cfg.credentials.clone(),
        &cfg.hostnames,
        cfg.host_id.clone(),
    );
    let app = handlers::router(state);

    let listener = TcpListener::bind(cfg.addr()).await?;
    tracing::info!("server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
