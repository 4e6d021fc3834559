//! AtlasKB CLI
//!
//! Knowledge box administration against a data directory. Shards are not
//! touched here: the ingest process creates them on first use.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use atlaskb::kv::{self, Driver, Transaction};
use atlaskb::migrator::Migrator;
use atlaskb::orm::{KnowledgeBox, KnowledgeBoxConfig, VectorSetConfig};
use atlaskb::processor::sequence;
use atlaskb::{AtlasError, Config, LocalDriver};

/// AtlasKB CLI
#[derive(Parser, Debug)]
#[command(name = "atlaskb-cli")]
#[command(about = "Knowledge box administration for AtlasKB")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./atlaskb_data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a knowledge box
    Create {
        /// Unique slug
        slug: String,

        #[arg(long, default_value = "")]
        title: String,

        /// Use this id instead of a generated one
        #[arg(long)]
        kbid: Option<String>,

        /// Vectorsets as `id` or `id:dimension`
        #[arg(long = "vectorset")]
        vectorsets: Vec<String>,
    },

    /// Change the slug or title of a knowledge box
    Update {
        kbid: String,

        #[arg(long)]
        slug: Option<String>,

        #[arg(long)]
        title: Option<String>,
    },

    /// Delete a knowledge box and all its resources
    Delete { kbid: String },

    /// List knowledge boxes whose slug starts with a prefix
    List {
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Show a knowledge box by id or slug
    Get { kbid_or_slug: String },

    /// Last applied sequence id of a partition
    Seqid { partition: String },

    /// Migration progress and pending knowledge boxes
    Migrations,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> atlaskb::Result<()> {
    let config = Config::builder().data_dir(&args.data_dir).build();
    let driver = LocalDriver::open(&config)?;

    match args.command {
        Commands::Migrations => {
            let migrator = Migrator::new(Arc::new(driver.clone()), &config);
            let info = migrator.get_info().await?;
            println!("current: {}", info.current_version);
            match info.target_version {
                Some(target) => println!("target:  {}", target),
                None => println!("target:  none"),
            }
            for kbid in migrator.pending_kbs().await? {
                println!("pending: {}", kbid);
            }
        }
        command => {
            let mut txn = driver.begin(false).await?;
            let result = execute(txn.as_mut(), command).await;
            kv::close(txn.as_mut()).await;
            result?;
        }
    }

    driver.checkpoint()
}

/// Run one KB command in `txn`, committing it when something was written
async fn execute(txn: &mut dyn Transaction, command: Commands) -> atlaskb::Result<()> {
    match command {
        Commands::Create { slug, title, kbid, vectorsets } => {
            let kb_config = KnowledgeBoxConfig {
                title,
                vectorsets: vectorsets.iter().map(|v| parse_vectorset(v)).collect::<atlaskb::Result<_>>()?,
                ..Default::default()
            };
            let kbid = KnowledgeBox::create(txn, &slug, kb_config, kbid).await?;
            txn.commit().await?;
            println!("{}", kbid);
        }
        Commands::Update { kbid, slug, title } => {
            let mut kb_config = KnowledgeBox::get_config(txn, &kbid)
                .await?
                .ok_or_else(|| AtlasError::KnowledgeBoxNotFound(kbid.clone()))?;
            if let Some(title) = title {
                kb_config.title = title;
            }
            KnowledgeBox::update(txn, &kbid, slug.as_deref(), kb_config).await?;
            txn.commit().await?;
            println!("updated {}", kbid);
        }
        Commands::Delete { kbid } => {
            let removed = KnowledgeBox::delete(txn, &kbid).await?;
            txn.commit().await?;
            println!("deleted {} ({})", kbid, removed.slug);
        }
        Commands::List { prefix } => {
            for (slug, kbid) in KnowledgeBox::list(txn, &prefix).await? {
                println!("{}\t{}", slug, kbid);
            }
        }
        Commands::Get { kbid_or_slug } => {
            let kbid = KnowledgeBox::get_kbid_by_slug(txn, &kbid_or_slug)
                .await?
                .unwrap_or(kbid_or_slug);
            let kb_config = KnowledgeBox::get_config(txn, &kbid)
                .await?
                .ok_or_else(|| AtlasError::KnowledgeBoxNotFound(kbid.clone()))?;
            println!("kbid:      {}", kbid);
            println!("slug:      {}", kb_config.slug);
            println!("title:     {}", kb_config.title);
            println!("migration: {}", kb_config.migration_version);
            for vectorset in &kb_config.vectorsets {
                match vectorset.vector_dimension {
                    Some(dim) => println!("vectorset: {} ({} dims)", vectorset.vectorset_id, dim),
                    None => println!("vectorset: {}", vectorset.vectorset_id),
                }
            }
        }
        Commands::Seqid { partition } => match sequence::get_last_seqid(txn, &partition).await? {
            Some(seqid) => println!("{}", seqid),
            None => println!("none"),
        },
        Commands::Migrations => {}
    }
    Ok(())
}

fn parse_vectorset(value: &str) -> atlaskb::Result<VectorSetConfig> {
    let (id, dimension) = match value.split_once(':') {
        Some((id, dim)) => {
            let dim = dim
                .parse::<usize>()
                .map_err(|_| AtlasError::Config(format!("bad vectorset dimension in {:?}", value)))?;
            (id, Some(dim))
        }
        None => (value, None),
    };
    Ok(VectorSetConfig { vectorset_id: id.to_string(), vector_dimension: dimension })
}
