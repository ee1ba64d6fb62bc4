use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use lantern::config::Config;
use lantern::constants::SHUTDOWN_MARKER;
use lantern::http::{router, AppState};
use lantern::matcher::MatchJob;
use lantern::storage::match_cache::MatchCache;
use lantern::storage::posts::PostStore;

#[derive(Parser)]
#[command(name = "lantern", version, about = "Social-feed backend with a persistent semantic-matching engine")]
struct App {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Re-encode every post's fragments from the database
    RegenerateEmbeddings,
    /// Run initial population for every query whose cache is empty
    PopulateCaches,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lantern::tracing_init::init();
    let config = Config::from_env();

    match App::parse().command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::RegenerateEmbeddings => regenerate_embeddings(config),
        Commands::PopulateCaches => populate_caches(config),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.bind_addr.clone();
    let marker_path = config.data_dir.join(SHUTDOWN_MARKER);

    // A leftover marker means the previous stop was intentional; its
    // absence after a crash is what the operator looks for.
    if marker_path.exists() {
        std::fs::remove_file(&marker_path).ok();
    }

    // Fatal-startup: any failure here exits non-zero.
    let state = AppState::build(config)?;
    tracing::info!(bind = %bind_addr, "Startup checks passed");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    {
        let running = state.running.clone();
        let mut signals = Signals::new([SIGTERM, SIGINT])?;
        std::thread::Builder::new().name("signals".into()).spawn(move || {
            if let Some(signal) = signals.forever().next() {
                tracing::info!(signal, "Shutdown signal received");
                running.store(false, Ordering::Relaxed);
                let stamp = chrono::Utc::now().to_rfc3339();
                if let Err(e) = std::fs::write(&marker_path, stamp) {
                    tracing::warn!(error = %e, "Could not write shutdown marker");
                }
                shutdown_tx.send(()).ok();
            }
        })?;
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "Server listening");

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        })
        .await?;

    state.shutdown();
    tracing::info!("Server stopped");
    Ok(())
}

/// Rebuild the fragment store from the posts table.
fn regenerate_embeddings(config: Config) -> anyhow::Result<()> {
    let state = AppState::build(config)?;

    let posts = state.db.with(|conn| {
        let mut all = Vec::new();
        for template in ["post", "query", "profile"] {
            all.extend(PostStore::by_template(conn, template)?);
        }
        Ok(all)
    })?;

    let total = posts.len();
    let mut done = 0;
    for post in posts {
        match state.embeddings.put(post.id, &post.title, &post.summary, &post.body) {
            Ok(fragments) => {
                done += 1;
                tracing::info!(post_id = post.id, fragments, "Re-encoded");
            }
            Err(e) => tracing::warn!(post_id = post.id, error = %e, "Re-encoding failed"),
        }
    }

    tracing::info!(done, total, "Embedding regeneration finished");
    state.shutdown();
    Ok(())
}

/// Populate every query whose cached result set is empty.
fn populate_caches(config: Config) -> anyhow::Result<()> {
    let state = AppState::build(config)?;

    let queries = state.db.with(|conn| PostStore::by_template(conn, "query"))?;
    let total = queries.len();
    let mut populated = 0;

    for query in queries {
        let cached = state.db.with(|conn| MatchCache::results_for(conn, query.id))?;
        if !cached.is_empty() {
            continue;
        }
        let matcher = state.matcher.clone();
        let query_id = query.id;
        state
            .queue
            .run_sync(MatchJob::RematchQuery(query_id), move || matcher.populate_query(query_id))?;
        populated += 1;
        tracing::info!(query_id, "Cache populated");
    }

    tracing::info!(populated, total, "Cache population finished");
    state.shutdown();
    Ok(())
}
