//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Document change feeds and subscription management."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! Directory-backed feed: `<root>/<collection>/<document>.{json,yaml,yml}`.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use cion_config::Collection;
use futures::channel::mpsc::{self, UnboundedReceiver};
use futures::{stream, StreamExt};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

use crate::{ChangeEvent, ChangeStream, DocumentFeed, FeedError};

/// Feed reading one file per document and watching for edits.
#[derive(Debug, Clone)]
pub struct DirectoryFeed {
    root: PathBuf,
    debounce: Duration,
}

impl DirectoryFeed {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            debounce: Duration::from_millis(50),
        }
    }

    /// Delay applied after a filesystem event so bursts of writes coalesce.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_dir(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.name())
    }
}

#[async_trait]
impl DocumentFeed for DirectoryFeed {
    async fn current(&self, collection: Collection) -> Result<Vec<Value>, FeedError> {
        let dir = self.collection_dir(collection);
        let present = fs::try_exists(&dir).await.map_err(|source| FeedError::Io {
            path: dir.clone(),
            source,
        })?;
        if !present {
            debug!(collection = %collection, path = %dir.display(), "collection directory absent");
            return Ok(Vec::new());
        }
        Ok(load_dir(&dir)
            .await?
            .into_iter()
            .map(|(_, document)| document)
            .collect())
    }

    async fn subscribe(&self, collection: Collection) -> Result<ChangeStream, FeedError> {
        let dir = self.collection_dir(collection);
        fs::create_dir_all(&dir).await.map_err(|source| FeedError::Io {
            path: dir.clone(),
            source,
        })?;

        let (sender, events) = mpsc::unbounded();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let _ = sender.unbounded_send(event);
        })
        .map_err(|source| FeedError::Watch {
            path: dir.clone(),
            source,
        })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| FeedError::Watch {
                path: dir.clone(),
                source,
            })?;

        // Read after the watch is armed so no edit falls between the two.
        let cache = load_dir(&dir).await?.into_iter().collect();
        let state = WatchState {
            collection,
            dir,
            debounce: self.debounce,
            _watcher: watcher,
            events,
            cache,
        };
        let batches = stream::unfold(state, |mut state| async move {
            let batch = state.next_batch().await?;
            Some((batch, state))
        });
        Ok(batches.flat_map(stream::iter).boxed())
    }
}

struct WatchState {
    collection: Collection,
    dir: PathBuf,
    debounce: Duration,
    _watcher: RecommendedWatcher,
    events: UnboundedReceiver<notify::Result<notify::Event>>,
    cache: HashMap<PathBuf, Value>,
}

impl WatchState {
    async fn next_batch(&mut self) -> Option<Vec<Result<ChangeEvent, FeedError>>> {
        let first = self.events.next().await?;
        if !self.debounce.is_zero() {
            tokio::time::sleep(self.debounce).await;
        }
        let mut raw = vec![first];
        while let Ok(Some(event)) = self.events.try_next() {
            raw.push(event);
        }

        let mut batch = Vec::new();
        let mut touched = BTreeSet::new();
        for event in raw {
            match event {
                Ok(event) if matches!(event.kind, EventKind::Access(_)) => {}
                Ok(event) => touched.extend(event.paths.into_iter().filter(|path| is_document(path))),
                Err(source) => batch.push(Err(FeedError::Watch {
                    path: self.dir.clone(),
                    source,
                })),
            }
        }
        for path in touched {
            if let Some(change) = self.refresh(path).await {
                batch.push(Ok(change));
            }
        }
        Some(batch)
    }

    async fn refresh(&mut self, path: PathBuf) -> Option<ChangeEvent> {
        match read_document(&path).await {
            Ok(Some(document)) => {
                let old_value = self.cache.insert(path, document.clone());
                if old_value.as_ref() == Some(&document) {
                    return None;
                }
                Some(ChangeEvent::upsert(self.collection, old_value, document))
            }
            Ok(None) => self
                .cache
                .remove(&path)
                .map(|old_value| ChangeEvent::delete(self.collection, old_value)),
            Err(err) => {
                warn!(collection = %self.collection, error = %err, "ignoring unreadable document");
                None
            }
        }
    }
}

fn is_document(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("json" | "yaml" | "yml")
    )
}

/// Documents in `dir`, sorted by file name. Malformed files are skipped.
async fn load_dir(dir: &Path) -> Result<Vec<(PathBuf, Value)>, FeedError> {
    let io_error = |source: std::io::Error| FeedError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(dir).await.map_err(io_error)?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let path = entry.path();
        if !is_document(&path) {
            continue;
        }
        let is_file = fs::metadata(&path)
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false);
        if is_file {
            paths.push(path);
        }
    }
    paths.sort();

    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        match read_document(&path).await {
            Ok(Some(document)) => documents.push((path, document)),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "skipping unreadable document"),
        }
    }
    Ok(documents)
}

/// Read one document; `Ok(None)` when the file no longer exists.
async fn read_document(path: &Path) -> Result<Option<Value>, FeedError> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(FeedError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let parsed: Result<Value, String> = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&raw).map_err(|err| err.to_string()),
        _ => serde_yaml::from_str(&raw).map_err(|err| err.to_string()),
    };
    parsed.map(Some).map_err(|reason| FeedError::Document {
        path: path.to_path_buf(),
        reason,
    })
}
