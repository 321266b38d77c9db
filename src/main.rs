//! # Profile Fusion CLI (`pfx`)
//!
//! ## Usage
//!
//! ```bash
//! pfx --config ./config/pfx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pfx init` | Create the progress database and the vector collection |
//! | `pfx index` | Embed and store every profile from the source |
//! | `pfx search "<query>"` | Text similarity search |
//! | `pfx hybrid "<query>" --image <url>` | Image + text search |
//! | `pfx weights "<query>"` | Show the image/text split for a query |
//! | `pfx classify` | Resumable human vs brand classification |
//! | `pfx image validate <url>` | Fetch, validate and cache an image |
//! | `pfx image evict <url>` | Drop an image from the cache |
//! | `pfx status` | Point count and progress counters |
//!
//! ## Examples
//!
//! ```bash
//! pfx init
//! pfx index --batch-size 4
//! pfx search "personal trainer sydney" --account-type human --min-followers 10000
//! pfx hybrid "similar style but in melbourne" --image https://example.com/ref.jpg --json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use profile_fusion::commands;
use profile_fusion::config;
use profile_fusion::logging;
use profile_fusion::progress::ProgressMode;
use profile_fusion::search::SearchFilters;
use profile_fusion_core::models::{AccountLabel, FollowerTier};
use profile_fusion_core::store::SearchParams;

/// Profile Fusion CLI: index social profiles as fused image+text vectors,
/// search them, and classify accounts as human or brand.
#[derive(Parser)]
#[command(name = "pfx", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/pfx.toml`.
    #[arg(long, global = true, default_value = "./config/pfx.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Filters and paging shared by `search` and `hybrid`.
#[derive(clap::Args)]
struct SearchArgs {
    /// Only `human` or `brand` accounts.
    #[arg(long, value_parser = parse_label)]
    account_type: Option<AccountLabel>,

    /// Follower tier: none, nano, micro, macro, mega.
    #[arg(long, value_parser = parse_tier)]
    category: Option<FollowerTier>,

    #[arg(long)]
    min_followers: Option<u64>,

    #[arg(long)]
    max_followers: Option<u64>,

    /// Only private (`true`) or public (`false`) profiles.
    #[arg(long)]
    private: Option<bool>,

    #[arg(long, default_value_t = 10)]
    limit: usize,

    #[arg(long, default_value_t = 0)]
    offset: usize,

    /// Drop results scoring below this.
    #[arg(long)]
    min_score: Option<f32>,

    /// Print JSON instead of text.
    #[arg(long)]
    json: bool,
}

impl SearchArgs {
    fn filters(&self) -> SearchFilters {
        SearchFilters {
            account_type: self.account_type,
            category: self.category,
            min_followers: self.min_followers,
            max_followers: self.max_followers,
            is_private: self.private,
        }
    }

    fn params(&self) -> SearchParams {
        SearchParams {
            limit: self.limit,
            offset: self.offset,
            min_score: self.min_score,
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the progress database and the vector collection.
    ///
    /// Idempotent. Fails if the collection exists with a different
    /// vector size.
    Init,

    /// Index profiles from the configured source.
    ///
    /// Profiles whose content is unchanged since the last run are skipped.
    /// Ctrl-C stops after in-flight profiles; nothing half-done is stored.
    Index {
        /// Maximum number of profiles to process.
        #[arg(long)]
        limit: Option<usize>,

        /// Profiles processed concurrently (overrides config).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Re-embed every profile even if unchanged.
        #[arg(long)]
        no_skip_existing: bool,

        /// Show profile and post counts without embedding anything.
        #[arg(long)]
        dry_run: bool,

        /// Progress on stderr: off, human, json. Default: human on a TTY.
        #[arg(long, value_parser = ProgressMode::parse)]
        progress: Option<ProgressMode>,
    },

    /// Text similarity search.
    Search {
        query: String,

        #[command(flatten)]
        args: SearchArgs,
    },

    /// Hybrid image + text search.
    ///
    /// The image/text split is chosen per query from its wording.
    Hybrid {
        query: String,

        /// Reference image URL.
        #[arg(long)]
        image: String,

        #[command(flatten)]
        args: SearchArgs,
    },

    /// Show the image/text weights chosen for a query.
    Weights {
        query: String,

        #[arg(long)]
        json: bool,
    },

    /// Classify indexed profiles as human or brand.
    ///
    /// Resumable: reconciled profiles are skipped, failed ones retried.
    Classify {
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long, value_parser = ProgressMode::parse)]
        progress: Option<ProgressMode>,
    },

    /// Image cache utilities.
    Image {
        #[command(subcommand)]
        action: ImageAction,
    },

    /// Show point count and progress counters.
    Status,
}

#[derive(Subcommand)]
enum ImageAction {
    /// Fetch, validate and cache an image URL.
    Validate { url: String },
    /// Remove a URL from the cache, or everything with --all.
    Evict {
        url: Option<String>,
        #[arg(long)]
        all: bool,
    },
}

fn parse_label(s: &str) -> Result<AccountLabel, String> {
    s.parse()
}

fn parse_tier(s: &str) -> Result<FollowerTier, String> {
    match s.to_ascii_lowercase().as_str() {
        "none" => Ok(FollowerTier::None),
        "nano" => Ok(FollowerTier::Nano),
        "micro" => Ok(FollowerTier::Micro),
        "macro" => Ok(FollowerTier::Macro),
        "mega" => Ok(FollowerTier::Mega),
        other => Err(format!(
            "unknown category '{}': expected none, nano, micro, macro or mega",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging, cli.verbose);

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Index {
            limit,
            batch_size,
            no_skip_existing,
            dry_run,
            progress,
        } => {
            commands::run_index(&cfg, limit, batch_size, no_skip_existing, dry_run, progress)
                .await?
        }
        Commands::Search { query, args } => {
            commands::run_search(&cfg, &query, &args.filters(), args.params(), args.json).await?
        }
        Commands::Hybrid { query, image, args } => {
            commands::run_hybrid(
                &cfg,
                &query,
                &image,
                &args.filters(),
                args.params(),
                args.json,
            )
            .await?
        }
        Commands::Weights { query, json } => commands::run_weights(&cfg, &query, json).await?,
        Commands::Classify {
            limit,
            batch_size,
            progress,
        } => commands::run_classify(&cfg, limit, batch_size, progress).await?,
        Commands::Image { action } => match action {
            ImageAction::Validate { url } => commands::run_image_validate(&cfg, &url).await?,
            ImageAction::Evict { url, all } => {
                commands::run_image_evict(&cfg, url.as_deref(), all).await?
            }
        },
        Commands::Status => commands::run_status(&cfg).await?,
    }

    Ok(())
}
