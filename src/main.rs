use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use truespeed::admin::{self, AdminError, EXPORT_FILE_NAME, ProductForm};
use truespeed::catalog::{self, CatalogQuery, SortOrder};
use truespeed::config::{ConfigError, ServerConfig, StoreConfig};
use truespeed::mirror_server::{self, MirrorServerError, MirrorState};
use truespeed::remote::MirrorError;
use truespeed::sync::SyncStatus;
use truespeed::transfer::{self, TransferError, TransferOutcome};
use truespeed::{Product, ProductStore, StoreError};

/// Upper bound on waiting for mirror pushes and refreshes before exiting.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Admin(#[from] AdminError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error(transparent)]
    MirrorServer(#[from] MirrorServerError),
    #[error("{path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mirror server: {0}")]
    Serve(std::io::Error),
    #[error("no product with id {0}")]
    UnknownId(String),
    #[error("fragment carries no transfer payload")]
    NoTransfer,
    #[error("timed out waiting for mirror sync to finish")]
    FlushTimeout,
}

#[derive(Parser, Debug)]
#[command(name = "truespeed", about = "TrueSpeed product catalog store")]
struct Cli {
    /// Overrides `TRUESPEED_DATA_DIR`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Print products as JSON instead of a table.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the whole collection.
    List,
    /// Search, filter and sort like the storefront.
    Query(QueryArgs),
    /// Print the distinct categories.
    Categories,
    /// Add a product, or replace the one with `--id`.
    Upsert(UpsertArgs),
    Delete {
        id: String,
    },
    /// Replace the collection with the default sample set.
    Reset,
    Export {
        /// Output file; `-` for stdout.
        #[arg(long, default_value = EXPORT_FILE_NAME)]
        output: PathBuf,
    },
    /// Replace the collection with a JSON array file.
    Import {
        file: PathBuf,
    },
    /// Apply a `#bulk=` or `#scraped=` hand-off fragment.
    ImportFragment {
        fragment: String,
        /// Save a scraped listing immediately instead of only prefilling.
        #[arg(long, default_value_t = false)]
        auto_save: bool,
    },
    /// Merge listings queued in the pending import slot.
    ImportPending,
    /// Fetch the collection from the remote mirror.
    Pull,
    /// Push the local collection to the remote mirror.
    Push,
    /// Print changes made by other contexts until interrupted.
    Watch,
    /// Run the self-hosted mirror service.
    ServeMirror {
        /// Overrides `TRUESPEED_MIRROR_BIND`.
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Args, Debug)]
struct QueryArgs {
    #[arg(long, default_value = "")]
    term: String,
    #[arg(long)]
    category: Option<String>,
    /// `featured`, `price-asc`, `price-desc` or `alpha`.
    #[arg(long, default_value = "featured")]
    sort: String,
}

#[derive(Args, Debug)]
struct UpsertArgs {
    #[arg(long, default_value = "")]
    id: String,
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    category: String,
    #[arg(long, default_value = "0")]
    price: String,
    #[arg(long, default_value_t = false)]
    featured: bool,
    #[arg(long)]
    image: String,
    #[arg(long)]
    description: String,
}

impl From<UpsertArgs> for ProductForm {
    fn from(args: UpsertArgs) -> Self {
        Self {
            id: args.id,
            title: args.title,
            category: args.category,
            price: args.price,
            featured: args.featured.to_string(),
            image: args.image,
            description: args.description,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = dotenv {
        if !e.not_found() {
            tracing::warn!(error = %e, ".env file could not be loaded");
        }
    }

    let cli = Cli::parse();
    if let Command::ServeMirror { bind } = cli.command {
        return run_mirror(bind).await;
    }

    let mut config = StoreConfig::from_env()?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    let store = ProductStore::from_config(&config)?;
    let out = Output { json: cli.json };

    match cli.command {
        Command::List => out.products(&store.read()),
        Command::Query(args) => {
            let query = CatalogQuery {
                term: args.term,
                category: args.category,
                sort: args.sort.parse::<SortOrder>().unwrap_or_default(),
            };
            out.products(&query.apply(&store.read()));
        }
        Command::Categories => {
            for category in catalog::categories(&store.read()) {
                println!("{category}");
            }
        }
        Command::Upsert(args) => {
            let (outcome, product) = admin::upsert(&store, args.into())?;
            println!("{outcome:?}: {} ({})", product.title, product.id);
        }
        Command::Delete { id } => {
            if !admin::delete(&store, &id) {
                return Err(CliError::UnknownId(id));
            }
            println!("deleted {id}");
        }
        Command::Reset => {
            store.reset_to_defaults();
            println!("reset to {} default products", store.read().len());
        }
        Command::Export { output } => run_export(&store, &output)?,
        Command::Import { file } => {
            let text = std::fs::read_to_string(&file).map_err(|source| CliError::File { path: file, source })?;
            println!("imported {} products", admin::import_json(&store, &text)?);
        }
        Command::ImportFragment { fragment, auto_save } => {
            let transfer = transfer::parse_fragment(&fragment)?.ok_or(CliError::NoTransfer)?;
            report_transfer(&transfer::apply_transfer(&store, transfer, auto_save)?);
        }
        Command::ImportPending => match transfer::take_pending_import(store.cache())? {
            Some(listings) => println!("imported {} products", admin::merge_listings(&store, listings)),
            None => println!("nothing pending"),
        },
        Command::Pull => out.products(&store.read_from_remote().await),
        Command::Push if !store.has_mirror() => println!("no mirror configured; nothing pushed"),
        Command::Push => {
            store.write_to_remote(&store.read()).await?;
            println!("saved to cloud");
        }
        Command::Watch => run_watch(&store, config.refresh_interval, out).await,
        Command::ServeMirror { .. } => {}
    }

    flush(&store).await
}

// =============================================================================
// COMMANDS
// =============================================================================

fn run_export(store: &ProductStore, output: &Path) -> Result<(), CliError> {
    let text = admin::export_json(store)?;
    if output.as_os_str() == "-" {
        println!("{text}");
        return Ok(());
    }
    std::fs::write(output, text).map_err(|source| CliError::File { path: output.to_path_buf(), source })?;
    eprintln!("exported to {}", output.display());
    Ok(())
}

fn report_transfer(outcome: &TransferOutcome) {
    match outcome {
        TransferOutcome::Merged(added) => println!("imported {added} products"),
        TransferOutcome::Prefilled { saved: Some((outcome, product)), .. } => {
            println!("{outcome:?}: {} ({})", product.title, product.id);
        }
        TransferOutcome::Prefilled { form, saved: None } => {
            println!("prefilled form (not saved):");
            println!("  title:       {}", form.title);
            println!("  category:    {}", form.category);
            println!("  price:       {}", form.price);
            println!("  image:       {}", form.image);
            println!("  description: {}", form.description);
        }
        TransferOutcome::Empty => println!("nothing to import"),
    }
}

async fn run_watch(store: &ProductStore, refresh_every: Duration, out: Output) {
    let changed = Arc::new(Notify::new());
    let signal = Arc::clone(&changed);
    store.subscribe(move || signal.notify_one());

    let mut status = store.status();
    let tasks = store.start(refresh_every);
    eprintln!("watching {} (ctrl-c to stop)", store.context_id());

    loop {
        tokio::select! {
            () = changed.notified() => out.products(&store.read()),
            result = status.changed() => {
                if result.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                report_status(&current);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    tasks.abort();
}

fn report_status(status: &SyncStatus) {
    match status {
        SyncStatus::Idle => {}
        SyncStatus::Syncing(message) | SyncStatus::Success(message) => eprintln!("{message}"),
        SyncStatus::Error(message) => eprintln!("warning: {message}"),
    }
}

async fn run_mirror(bind: Option<String>) -> Result<(), CliError> {
    let mut config = ServerConfig::from_env()?;
    if let Some(bind) = bind {
        config.bind = bind;
    }
    let state = match config.file {
        Some(file) => MirrorState::persistent(config.api_key, file).await?,
        None => MirrorState::in_memory(config.api_key),
    };
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .map_err(CliError::Serve)?;
    mirror_server::serve(listener, state).await.map_err(CliError::Serve)
}

/// Wait for queued mirror pushes and any refresh a seeding `read` started,
/// so the process does not exit mid-sync.
async fn flush(store: &ProductStore) -> Result<(), CliError> {
    tokio::time::timeout(FLUSH_TIMEOUT, async {
        while !store.is_sync_idle() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .map_err(|_| CliError::FlushTimeout)
}

// =============================================================================
// OUTPUT
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn products(self, products: &[Product]) {
        if self.json {
            match serde_json::to_string_pretty(products) {
                Ok(text) => println!("{text}"),
                Err(e) => tracing::error!(error = %e, "product encode failed"),
            }
            return;
        }
        for product in products {
            let star = if product.featured { "*" } else { " " };
            println!(
                "{star} {:<16} {:<28} {:<14} {:>10}",
                product.id,
                product.title,
                product.category,
                catalog::format_price(product.price)
            );
        }
    }
}
