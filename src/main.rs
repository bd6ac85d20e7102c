// Entity Registry - command line
//
// init      create the schema
// ingest    CSV snapshots -> work queue
// work      run the reconciliation workers
// get       point-in-time read of one entity
// history   every version that ever held one entity
// search    validated attribute search, or its OData rendering
// rematch   re-derive the whole link set at one point in time
// rejected  items the workers gave up on

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use entity_registry::{
    load_csv, AttributeRegistry, BulkMatcher, EntityKey, FilterGroup, Matcher, Reconciler,
    RegistryConfig, Repository, SearchError, SearchRequest, WorkerPool,
};
use entity_registry::temporal::parse_instant;

#[derive(Parser)]
#[command(name = "entity-registry", version, about = "Temporal entity registry with rule-based matching")]
struct Cli {
    /// TOML config file; built-in defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,

    /// Read snapshots from a CSV file and enqueue them
    Ingest {
        file: PathBuf,
    },

    /// Run the worker pool
    Work {
        /// Stop once the queue is empty
        #[arg(long)]
        drain: bool,
    },

    /// Print the version holding an entity, as JSON
    Get {
        entity_type: String,
        source: String,
        id: String,

        /// RFC 3339 instant, defaults to now
        #[arg(long, value_parser = parse_at)]
        at: Option<DateTime<Utc>>,
    },

    /// Print every version that ever held an entity, oldest first
    History {
        entity_type: String,
        source: String,
        id: String,
    },

    /// Search one entity type with a JSON filter group
    Search {
        entity_type: String,

        /// e.g. {"filters":[{"field":"ukprn","operator":"Equals","value":"10012345"}]}
        #[arg(long)]
        filter: String,

        #[arg(long, value_parser = parse_at)]
        at: Option<DateTime<Utc>>,

        #[arg(long, default_value_t = 0)]
        skip: usize,

        #[arg(long, default_value_t = 25)]
        take: usize,

        /// Print the equivalent OData search request instead of running it
        #[arg(long)]
        odata: bool,
    },

    /// Run the bulk matcher and print link counts
    Rematch {
        #[arg(long, value_parser = parse_at)]
        at: Option<DateTime<Utc>>,
    },

    /// List queue items that were rejected, with their reasons
    Rejected,
}

fn parse_at(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_instant(raw).ok_or_else(|| format!("'{}' is not an RFC 3339 instant", raw))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("entity_registry=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = RegistryConfig::load(cli.config.as_deref())?;
    let registry = Arc::new(AttributeRegistry::new());
    config.validate(&registry)?;

    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Init => {
            let repo = config.open_repository(registry)?;
            config.open_queue()?;
            println!(
                "✓ Registry initialised at {} ({} versions)",
                config.database_path.display(),
                repo.version_count()?
            );
        }

        Commands::Ingest { file } => {
            let items = load_csv(&file)?;
            let queue = config.open_queue()?;
            for item in &items {
                queue.enqueue(item)?;
            }
            println!("✓ Enqueued {} snapshots (queue depth {})", items.len(), queue.depth()?);
        }

        Commands::Work { drain } => {
            let repo: Arc<dyn Repository> = Arc::new(config.open_repository(Arc::clone(&registry))?);
            let matcher = Matcher::new(Arc::clone(&repo), Arc::new(config.profile_set()), registry)
                .with_page_size(config.search_page_size);
            let reconciler = Reconciler::new(repo, matcher, config.entity_types.clone());
            let queue = Arc::new(config.open_queue()?);

            let pool = WorkerPool::new(queue, Arc::new(reconciler), config.worker_options(drain));
            let stats = pool.run(&cancel)?;
            println!(
                "✓ Processed {}, rejected {}, released {}",
                stats.processed, stats.rejected, stats.released
            );
        }

        Commands::Get {
            entity_type,
            source,
            id,
            at,
        } => {
            let repo = config.open_repository(registry)?;
            let key = EntityKey::new(&entity_type, &source, &id);
            match repo.retrieve(&key, at.unwrap_or_else(Utc::now), &cancel)? {
                Some(version) => println!("{}", serde_json::to_string_pretty(&version)?),
                None => bail!("{} not found", key),
            }
        }

        Commands::History { entity_type, source, id } => {
            let repo = config.open_repository(registry)?;
            let key = EntityKey::new(&entity_type, &source, &id);
            let history = repo.history(&key, &cancel)?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }

        Commands::Search {
            entity_type,
            filter,
            at,
            skip,
            take,
            odata,
        } => {
            let group: FilterGroup = serde_json::from_str(&filter).context("--filter is not a valid filter group")?;
            let mut request = SearchRequest::new(vec![group]).page(skip, take);
            request.point_in_time = at;

            let result = if odata {
                request.odata(&registry, &entity_type).map(serde_json::to_value)
            } else {
                let repo = config.open_repository(Arc::clone(&registry))?;
                request
                    .execute(&repo, &registry, &entity_type, &cancel)
                    .map(serde_json::to_value)
            };

            match result {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value?)?),
                Err(SearchError::Invalid(problems)) => {
                    for problem in &problems {
                        eprintln!("✗ {}", problem);
                    }
                    bail!("search request has {} problem(s)", problems.len());
                }
                Err(err) => return Err(err.into()),
            }
        }

        Commands::Rematch { at } => {
            let repo: Arc<dyn Repository> = Arc::new(config.open_repository(Arc::clone(&registry))?);
            let bulk = BulkMatcher::new(repo, Arc::new(config.profile_set()), registry, config.workers.count);
            let report = bulk.run(at.unwrap_or_else(Utc::now), &cancel)?;

            info!(point_in_time = %report.point_in_time, "rematch complete");
            println!("✓ Matched {} entities", report.entities);
            println!("  Synonym links: {}", report.synonym_links.len());
            println!("  Typed links:   {}", report.links.len());
        }

        Commands::Rejected => {
            let queue = config.open_queue()?;
            for item in queue.rejected()? {
                println!("{}  attempts={}  {}", item.id, item.attempts, item.reason);
            }
        }
    }

    Ok(())
}
