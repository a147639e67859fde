//! AlarmSage: machine-fault assistant server and indexing CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use alarmsage_chat::{create_chat_model, LLMConfig};
use alarmsage_core::AlarmSageConfig;
use alarmsage_infer::{create_embedder, Embedder};
use alarmsage_server::{build_router, indexing, AppState};
use alarmsage_store::SqliteStore;

fn resolve_data_dir() -> PathBuf {
    std::env::var("ALARMSAGE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}

/// Store and embedder only; indexing without page images needs no chat credentials.
fn open_index_backends(config: &AlarmSageConfig) -> anyhow::Result<(SqliteStore, Arc<dyn Embedder>)> {
    let llm_config = LLMConfig::load(&config.data_paths.llm_config_file)?;
    let store = SqliteStore::open(&config.data_paths.db, config.embedding_dim)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;
    let embedder = create_embedder(
        config.embedding_provider,
        config.embedding_dim,
        llm_config.openai_api_key.as_deref(),
        None,
    )?;
    Ok((store, embedder))
}

fn print_help() {
    println!("AlarmSage: machine alarm and manual assistant");
    println!();
    println!("Usage: alarmsage [command]");
    println!();
    println!("Commands:");
    println!("  (none) | serve              Start the server");
    println!("  index-manual <file.json> [--images]");
    println!("                              Index a parsed manual into its collection, optionally");
    println!("                              with model summaries of its page images");
    println!("  reembed-alarms [--all]      Embed alarms missing a vector (or all alarms)");
    println!("  help                        Show this help message");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let data_dir = resolve_data_dir();

    match args.get(1).map(String::as_str) {
        None | Some("serve") => serve(&data_dir).await,
        Some("index-manual") => {
            let Some(file) = args.get(2) else {
                eprintln!("Usage: alarmsage index-manual <parsed-manual.json> [--images]");
                std::process::exit(1);
            };
            let with_images = args.iter().skip(3).any(|a| a == "--images");
            let config = AlarmSageConfig::from_env(&data_dir)?;
            let (store, embedder) = open_index_backends(&config)?;
            let path = resolve_manual_path(&config, file);
            let model = if with_images {
                let llm_config = LLMConfig::load(&config.data_paths.llm_config_file)?;
                Some(create_chat_model(&llm_config)?)
            } else {
                None
            };
            let images = model.as_ref().map(|model| indexing::PageImageSummaries {
                model: model.as_ref(),
                images_dir: &config.data_paths.page_images,
                timeouts: &config.timeouts,
            });
            let written =
                indexing::index_manual(&store, embedder.as_ref(), &path, images.as_ref()).await?;
            println!("Indexed {} chunks from {}", written, path.display());
            Ok(())
        }
        Some("reembed-alarms") => {
            let all = args.iter().skip(2).any(|a| a == "--all");
            let config = AlarmSageConfig::from_env(&data_dir)?;
            let (store, embedder) = open_index_backends(&config)?;
            let updated = indexing::reembed_alarms(&store, embedder.as_ref(), all).await?;
            println!("Embedded {} alarms", updated);
            Ok(())
        }
        Some("--help") | Some("-h") | Some("help") => {
            print_help();
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {}. Use 'alarmsage help' for usage.", other);
            std::process::exit(1);
        }
    }
}

/// Bare file names are looked up in the parsed-manuals directory.
fn resolve_manual_path(config: &AlarmSageConfig, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.exists() || path.components().count() > 1 {
        path.to_path_buf()
    } else {
        config.data_paths.parsed_manuals.join(file)
    }
}

async fn serve(data_dir: &Path) -> anyhow::Result<()> {
    info!("Data directory: {}", data_dir.display());

    let config = AlarmSageConfig::from_env(data_dir)?;
    let port = config.port;

    let state = Arc::new(AppState::from_config(config)?);
    info!(
        "Chat model: {}, embedder: {}",
        state.chat_model,
        state.embedder.name()
    );

    indexing::start_embedding_catchup(state.store.clone(), state.embedder.clone());

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("AlarmSage server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
