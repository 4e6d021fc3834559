//! AtlasKB Ingest Binary
//!
//! Consumes one partition of broker messages from a JSON-lines file (or
//! stdin) and applies them through the processor.
//!
//! Each line is `{"seqid": <n>, "message": {<BrokerMessage>}}`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use atlaskb::kv::{self, Driver};
use atlaskb::model::BrokerMessage;
use atlaskb::processor::{FileDeadletterStore, LocalPubSub, LogAuditSink, Notification};
use atlaskb::shard::IndexNode;
use atlaskb::{AtlasError, Config, LocalDriver, LocalIndexNode, Processor, RetryingDriver, ShardManager};

/// AtlasKB Ingest
#[derive(Parser, Debug)]
#[command(name = "atlaskb-ingest")]
#[command(about = "Apply a partition of broker messages to an AtlasKB data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./atlaskb_data")]
    data_dir: PathBuf,

    /// Partition the messages belong to
    #[arg(short, long, default_value = "0")]
    partition: String,

    /// JSON-lines message file; stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Number of in-process index nodes
    #[arg(long, default_value = "1")]
    nodes: usize,

    /// Replicas per logical shard
    #[arg(long, default_value = "1")]
    replicas: usize,

    /// Field count above which a new shard is created
    #[arg(long, default_value = "200000")]
    max_node_fields: u64,

    /// Stop at the first failed message instead of moving on
    #[arg(long)]
    stop_on_error: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    seqid: i64,
    message: BrokerMessage,
}

#[derive(Debug, Default)]
struct Summary {
    applied: usize,
    replayed: usize,
    failed: usize,
}

#[tokio::main]
async fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atlaskb=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    info!("AtlasKB Ingest v{}", atlaskb::VERSION);
    info!("Data directory: {}", args.data_dir.display());
    info!("Partition: {}", args.partition);

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .shard_replicas(args.replicas)
        .max_node_fields(args.max_node_fields)
        .build();

    match run(args, config).await {
        Ok(summary) => info!(
            applied = summary.applied,
            replayed = summary.replayed,
            failed = summary.failed,
            "Ingest finished"
        ),
        Err(e) => {
            error!("Ingest failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Args, config: Config) -> atlaskb::Result<Summary> {
    config.validate()?;

    let local = LocalDriver::open(&config)?;
    let driver: Arc<dyn Driver> = Arc::new(RetryingDriver::new(local.clone(), config.retry_policy()));

    let mut nodes: Vec<Arc<dyn IndexNode>> = Vec::new();
    for i in 0..args.nodes.max(1) {
        nodes.push(Arc::new(LocalIndexNode::new(format!("node-{}", i), config.index_queue_depth)?));
    }
    let shards = Arc::new(ShardManager::new(Arc::clone(&driver), nodes, &config));

    let pubsub = Arc::new(LocalPubSub::new(1024));
    let mut notifications = pubsub.subscribe();
    tokio::spawn(async move {
        while let Ok(published) = notifications.recv().await {
            match Notification::decode(&published.payload) {
                Ok(n) => debug!(channel = %published.channel, uuid = %n.uuid, seqid = n.seqid, action = ?n.action, "Notification"),
                Err(e) => warn!("Undecodable notification: {}", e),
            }
        }
    });

    let processor = Processor::new(
        Arc::clone(&driver),
        shards,
        pubsub,
        Arc::new(LogAuditSink),
        Arc::new(FileDeadletterStore::new(config.deadletter_dir())),
        config.clone(),
    );

    rebuild_index(&processor).await?;

    let summary = consume(&processor, &args).await?;
    local.checkpoint()?;
    Ok(summary)
}

/// Index nodes live in this process only: shards recorded by an earlier run
/// point nowhere, so they are dropped and every resource is indexed again.
async fn rebuild_index(processor: &Processor) -> atlaskb::Result<()> {
    for (slug, kbid) in processor.list_kbs("").await? {
        let mut txn = processor.driver().begin(false).await?;
        let result: atlaskb::Result<Vec<String>> = async {
            ShardManager::forget_shards(txn.as_mut(), &kbid).await?;
            let uuids = atlaskb::orm::KnowledgeBox::new(kbid.as_str()).resource_uuids(txn.as_mut()).await?;
            txn.commit().await?;
            Ok(uuids)
        }
        .await;
        kv::close(txn.as_mut()).await;

        let uuids = result?;
        for uuid in &uuids {
            if let Err(e) = processor.reindex_resource(&kbid, uuid).await {
                warn!(kbid = %kbid, uuid = %uuid, "Failed to reindex resource: {}", e);
            }
        }
        info!(kbid = %kbid, slug = %slug, resources = uuids.len(), "Rebuilt index");
    }
    Ok(())
}

async fn consume(processor: &Processor, args: &Args) -> atlaskb::Result<Summary> {
    let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(reader).lines();
    let mut summary = Summary::default();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let envelope: Envelope = serde_json::from_str(&line)?;
        match processor.process(envelope.message, envelope.seqid, &args.partition).await {
            Ok(true) => summary.applied += 1,
            Ok(false) => summary.replayed += 1,
            Err(e) => {
                summary.failed += 1;
                if args.stop_on_error {
                    return Err(e);
                }
                if let AtlasError::Deadlettered { seqid, .. } = &e {
                    warn!(seqid, "Message deadlettered; continuing");
                } else {
                    error!(seqid = envelope.seqid, "Message failed: {}", e);
                }
            }
        }
    }
    Ok(summary)
}
