use anyhow::{bail, Result};
use archive_core::cache::PersistentCache;
use archive_core::source::{DirSource, HttpSource, PayloadSource, TranscriptDir, TranscriptSource};
use archive_core::{ArchiveService, LoaderConfig, INDEX_FORMAT_VERSION};
use archive_server::build_app;
use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
struct Args {
    /// URL of the search index payload
    #[arg(long, requires = "comics_url")]
    index_url: Option<String>,
    /// URL of the comics transcript payload
    #[arg(long, requires = "index_url")]
    comics_url: Option<String>,
    /// Directory written by `indexer build`, used instead of URLs
    #[arg(long, conflicts_with_all = ["index_url", "comics_url"])]
    source_dir: Option<String>,
    /// Persistent cache directory
    #[arg(long, default_value = "./cache")]
    cache_dir: String,
    /// Payload version this build accepts
    #[arg(long, default_value = INDEX_FORMAT_VERSION)]
    expected_version: String,
    /// Raw transcripts to rebuild from when no payload can be loaded
    #[arg(long)]
    transcripts: Option<String>,
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let source: Arc<dyn PayloadSource> = match (&args.source_dir, &args.index_url, &args.comics_url) {
        (Some(dir), _, _) => Arc::new(DirSource::new(dir)),
        (None, Some(index), Some(comics)) => Arc::new(HttpSource::new(index, comics)?),
        _ => bail!("either --source-dir or both --index-url and --comics-url are required"),
    };
    let cache = match PersistentCache::open_dir(&args.cache_dir) {
        Ok(cache) => cache,
        Err(e) => {
            tracing::warn!(dir = %args.cache_dir, error = %e, "persistent cache unavailable; caching in memory");
            PersistentCache::in_memory()
        }
    };
    let fallback = args.transcripts.as_ref().map(|dir| Arc::new(TranscriptDir::new(dir)) as Arc<dyn TranscriptSource>);
    let config = LoaderConfig { expected_version: args.expected_version.clone(), ..LoaderConfig::default() };
    let service = ArchiveService::new(config, source, cache, fallback);

    let loading = service.clone();
    tokio::spawn(async move {
        if let Err(e) = loading.load().await {
            tracing::error!(error = %e, "initial load failed; POST /admin/reload to retry");
        }
    });

    let app: Router = build_app(service);
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
