//! In-process index node
//!
//! Shard data lives on a dedicated worker thread. Requests reach it through
//! a bounded crossbeam queue, so a slow index applies backpressure to the
//! async callers, and every reply (or error) comes back on the request's own
//! oneshot channel.

use std::collections::{BTreeMap, HashMap};
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{AtlasError, Result};
use crate::index::{IndexMessage, IndexParagraph, IndexStatus, TextInformation, VectorSentence};
use crate::model::{Relation, Security};
use super::{IndexNode, OpStatus, ShardInfo};

/// What a replica holds for one resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexedDocument {
    pub status: IndexStatus,
    pub labels: Vec<String>,
    pub security: Option<Security>,
    /// field key → text
    pub texts: BTreeMap<String, TextInformation>,
    /// paragraph key → paragraph, without its sentences
    pub paragraphs: BTreeMap<String, IndexParagraph>,
    /// vectorset → sentence key → sentence
    pub sentences: BTreeMap<String, BTreeMap<String, VectorSentence>>,
    /// field key → relations
    pub relations: BTreeMap<String, Vec<Relation>>,
}

impl IndexedDocument {
    fn sentence_count(&self) -> usize {
        self.sentences.values().map(BTreeMap::len).sum()
    }

    fn apply(&mut self, message: &IndexMessage) {
        let rid = message.uuid();

        self.texts
            .retain(|field, _| !under_any(&format!("{}/{}", rid, field), &message.texts_to_delete));
        self.paragraphs.retain(|key, _| !under_any(key, &message.paragraphs_to_delete));
        for sentences in self.sentences.values_mut() {
            sentences.retain(|key, _| !under_any(key, &message.sentences_to_delete));
        }
        for (vectorset, prefixes) in &message.vector_prefixes_to_delete {
            if let Some(sentences) = self.sentences.get_mut(vectorset) {
                sentences.retain(|key, _| !under_any(key, prefixes));
            }
        }
        self.relations
            .retain(|field, _| !message.relation_fields_to_delete.contains(field));

        self.status = message.status;
        self.labels = message.labels.clone();
        self.security = message.security.clone();

        if !message.skip_texts.unwrap_or(false) {
            self.texts.extend(message.texts.clone());
        }
        let index_paragraphs = !message.skip_paragraphs.unwrap_or(false);
        for (key, paragraph) in message.paragraphs.values().flat_map(|p| p.paragraphs.iter()) {
            for (vectorset, sentences) in &paragraph.vectorsets_sentences {
                self.sentences
                    .entry(vectorset.clone())
                    .or_default()
                    .extend(sentences.sentences.clone());
            }
            if index_paragraphs {
                let mut stored = paragraph.clone();
                stored.vectorsets_sentences.clear();
                self.paragraphs.insert(key.clone(), stored);
            }
        }
        self.relations.extend(message.field_relations.clone());
    }
}

/// `key` equals one of `prefixes` or lies under it
fn under_any(key: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| {
        key.strip_prefix(prefix.as_str())
            .map(|rest| rest.is_empty() || rest.starts_with('/'))
            .unwrap_or(false)
    })
}

// =============================================================================
// Worker
// =============================================================================

enum Request {
    NewShard { kbid: String },
    DeleteShard { shard_id: String },
    AddResource { shard_id: String, message: Box<IndexMessage> },
    DeleteResource { shard_id: String, uuid: String },
    ListShards,
    GetShard { shard_id: String },
    GetDocument { shard_id: String, uuid: String },
}

enum Reply {
    Created(String),
    Done,
    Status(OpStatus),
    Shards(Vec<String>),
    Info(ShardInfo),
    Document(Option<Box<IndexedDocument>>),
}

struct Job {
    request: Request,
    reply: oneshot::Sender<Result<Reply>>,
}

#[derive(Default)]
struct ShardData {
    kbid: String,
    documents: HashMap<String, IndexedDocument>,
}

impl ShardData {
    fn info(&self) -> ShardInfo {
        ShardInfo {
            resources: self.documents.len() as u64,
            fields: self.documents.values().map(|d| d.texts.len() as u64).sum(),
            paragraphs: self.documents.values().map(|d| d.paragraphs.len() as u64).sum(),
            sentences: self.documents.values().map(|d| d.sentence_count() as u64).sum(),
        }
    }

    fn status(&self, shard_id: &str) -> OpStatus {
        let info = self.info();
        OpStatus { shard_id: shard_id.to_string(), count: info.resources, fields: info.fields }
    }
}

#[derive(Default)]
struct NodeState {
    shards: HashMap<String, ShardData>,
}

impl NodeState {
    fn shard_mut(&mut self, shard_id: &str) -> Result<&mut ShardData> {
        self.shards
            .get_mut(shard_id)
            .ok_or_else(|| AtlasError::ShardNotFound(shard_id.to_string()))
    }

    fn handle(&mut self, request: Request) -> Result<Reply> {
        match request {
            Request::NewShard { kbid } => {
                let shard_id = Uuid::new_v4().to_string();
                self.shards
                    .insert(shard_id.clone(), ShardData { kbid, documents: HashMap::new() });
                Ok(Reply::Created(shard_id))
            }
            Request::DeleteShard { shard_id } => {
                match self.shards.remove(&shard_id) {
                    Some(data) => debug!(shard = %shard_id, kbid = %data.kbid, "Deleted shard"),
                    None => warn!(shard = %shard_id, "Deleting unknown shard"),
                }
                Ok(Reply::Done)
            }
            Request::AddResource { shard_id, message } => {
                let shard = self.shard_mut(&shard_id)?;
                shard
                    .documents
                    .entry(message.uuid().to_string())
                    .or_default()
                    .apply(&message);
                Ok(Reply::Status(shard.status(&shard_id)))
            }
            Request::DeleteResource { shard_id, uuid } => {
                let shard = self.shard_mut(&shard_id)?;
                shard.documents.remove(&uuid);
                Ok(Reply::Status(shard.status(&shard_id)))
            }
            Request::ListShards => Ok(Reply::Shards(self.shards.keys().cloned().collect())),
            Request::GetShard { shard_id } => Ok(Reply::Info(self.shard_mut(&shard_id)?.info())),
            Request::GetDocument { shard_id, uuid } => {
                let shard = self.shard_mut(&shard_id)?;
                Ok(Reply::Document(shard.documents.get(&uuid).cloned().map(Box::new)))
            }
        }
    }
}

fn worker_loop(node_id: String, jobs: Receiver<Job>) {
    let mut state = NodeState::default();
    while let Ok(job) = jobs.recv() {
        let reply = state.handle(job.request);
        if job.reply.send(reply).is_err() {
            trace!(node = %node_id, "Index request caller went away");
        }
    }
    debug!(node = %node_id, shards = state.shards.len(), "Index worker stopped");
}

// =============================================================================
// Node
// =============================================================================

pub struct LocalIndexNode {
    id: String,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl LocalIndexNode {
    /// Start a node whose queue holds at most `queue_depth` pending requests
    pub fn new(id: impl Into<String>, queue_depth: usize) -> Result<Self> {
        let id = id.into();
        let (tx, rx) = channel::bounded(queue_depth.max(1));
        let worker_id = id.clone();
        let worker = thread::Builder::new()
            .name(format!("index-{}", id))
            .spawn(move || worker_loop(worker_id, rx))?;
        Ok(Self { id, jobs: Some(tx), worker: Some(worker) })
    }

    /// What a replica holds for `uuid`
    pub async fn document(&self, shard_id: &str, uuid: &str) -> Result<Option<IndexedDocument>> {
        let request = Request::GetDocument { shard_id: shard_id.to_string(), uuid: uuid.to_string() };
        match self.call(request).await? {
            Reply::Document(document) => Ok(document.map(|d| *d)),
            _ => Err(self.unexpected_reply()),
        }
    }

    async fn call(&self, request: Request) -> Result<Reply> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| AtlasError::Index(format!("index node {} is stopped", self.id)))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job { request, reply: reply_tx };

        match jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                // Queue is full: wait for room off the async runtime
                let jobs = jobs.clone();
                tokio::task::spawn_blocking(move || jobs.send(job))
                    .await
                    .map_err(|e| AtlasError::Index(e.to_string()))?
                    .map_err(|_| self.stopped())?;
            }
            Err(TrySendError::Disconnected(_)) => return Err(self.stopped()),
        }

        reply_rx.await.map_err(|_| self.stopped())?
    }

    fn stopped(&self) -> AtlasError {
        AtlasError::Index(format!("index node {} worker is gone", self.id))
    }

    fn unexpected_reply(&self) -> AtlasError {
        AtlasError::Index(format!("index node {} sent an unexpected reply", self.id))
    }
}

#[async_trait]
impl IndexNode for LocalIndexNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn new_shard(&self, kbid: &str) -> Result<String> {
        match self.call(Request::NewShard { kbid: kbid.to_string() }).await? {
            Reply::Created(shard_id) => Ok(shard_id),
            _ => Err(self.unexpected_reply()),
        }
    }

    async fn delete_shard(&self, shard_id: &str) -> Result<()> {
        match self.call(Request::DeleteShard { shard_id: shard_id.to_string() }).await? {
            Reply::Done => Ok(()),
            _ => Err(self.unexpected_reply()),
        }
    }

    async fn add_resource(&self, shard_id: &str, message: &IndexMessage) -> Result<OpStatus> {
        let request = Request::AddResource {
            shard_id: shard_id.to_string(),
            message: Box::new(message.clone()),
        };
        match self.call(request).await? {
            Reply::Status(status) => Ok(status),
            _ => Err(self.unexpected_reply()),
        }
    }

    async fn delete_resource(&self, shard_id: &str, uuid: &str) -> Result<OpStatus> {
        let request = Request::DeleteResource { shard_id: shard_id.to_string(), uuid: uuid.to_string() };
        match self.call(request).await? {
            Reply::Status(status) => Ok(status),
            _ => Err(self.unexpected_reply()),
        }
    }

    async fn list_shards(&self) -> Result<Vec<String>> {
        match self.call(Request::ListShards).await? {
            Reply::Shards(shards) => Ok(shards),
            _ => Err(self.unexpected_reply()),
        }
    }

    async fn get_shard(&self, shard_id: &str) -> Result<ShardInfo> {
        match self.call(Request::GetShard { shard_id: shard_id.to_string() }).await? {
            Reply::Info(info) => Ok(info),
            _ => Err(self.unexpected_reply()),
        }
    }
}

impl Drop for LocalIndexNode {
    fn drop(&mut self) {
        // Closing the queue ends the worker loop
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(node = %self.id, "Index worker panicked");
            }
        }
    }
}
