//! Sequential background batches with shared, snapshot-only progress.
//!
//! One batch runs at a time. Items are processed strictly in order on a
//! single blocking task; a failing or panicking item is recorded and the
//! batch moves on. Readers only ever receive clones of [`ProcessingStatus`],
//! either by polling [`BatchOrchestrator::status`] or from the broadcast
//! channel returned by [`BatchOrchestrator::subscribe`].

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::fetch::Fetcher;
use crate::logging::panic_payload_to_string;
use crate::pipeline::{DimensionSpec, ImageProcessor};
use crate::storage::{expand_home, sanitize_filename, save_image};

const STATUS_CHANNEL_CAPACITY: usize = 64;
const INTERRUPTED_MESSAGE: &str = "batch interrupted";

/// Where an item's encoded bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ImageSource {
    /// Base64, optionally as a `data:` URL.
    Inline { data: String },
    Remote { url: String },
    File { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub id: String,
    pub source: ImageSource,
    /// Display name, also the output file stem. Falls back to `id`.
    #[serde(default)]
    pub name: String,
    /// Unparsed [`DimensionSpec`]; parsed per item so a bad spec fails only
    /// that item.
    #[serde(default)]
    pub dimension: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Pending,
    Processing,
    Done,
    Error,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemStatus {
    pub id: String,
    pub state: ItemState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

impl BatchItemStatus {
    fn pending(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: ItemState::Pending,
            error_message: None,
            output_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatus {
    pub is_processing: bool,
    pub total: usize,
    /// Index of the item being (or last) processed; `total` once finished.
    pub current_index: usize,
    pub progress_percent: u8,
    pub items: Vec<BatchItemStatus>,
    pub done: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProcessingStatus {
    fn started(items: &[BatchItem]) -> Self {
        Self {
            is_processing: true,
            total: items.len(),
            current_index: 0,
            progress_percent: 0,
            items: items.iter().map(|item| BatchItemStatus::pending(&item.id)).collect(),
            done: false,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    pub fn completed_count(&self) -> usize {
        self.items.iter().filter(|item| item.state.is_terminal()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.state == ItemState::Error)
            .count()
    }

    fn refresh_progress(&mut self) {
        self.progress_percent = progress_percent(self.completed_count(), self.total);
    }

    fn finish(&mut self) {
        for item in self.items.iter_mut().filter(|item| !item.state.is_terminal()) {
            item.state = ItemState::Error;
            item.error_message = Some(INTERRUPTED_MESSAGE.to_string());
        }
        self.is_processing = false;
        self.done = true;
        self.current_index = self.total;
        self.progress_percent = 100;
        self.finished_at = Some(Utc::now());
    }
}

/// `floor(completed / total * 100)`; an empty batch counts as complete.
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((completed.min(total) * 100) / total) as u8
}

struct Inner {
    processor: ImageProcessor,
    fetcher: Arc<dyn Fetcher>,
    status: Mutex<ProcessingStatus>,
    events: broadcast::Sender<ProcessingStatus>,
}

impl Inner {
    fn lock_status(&self) -> MutexGuard<'_, ProcessingStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mutates the status and publishes the resulting snapshot while still
    /// holding the lock, so publications follow transition order.
    fn update(&self, mutate: impl FnOnce(&mut ProcessingStatus)) {
        let mut status = self.lock_status();
        mutate(&mut status);
        let _ = self.events.send(status.clone());
    }
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("processor", &self.inner.processor)
            .field("is_processing", &self.is_processing())
            .finish()
    }
}

impl BatchOrchestrator {
    pub fn new(processor: ImageProcessor, fetcher: Arc<dyn Fetcher>) -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                processor,
                fetcher,
                status: Mutex::new(ProcessingStatus::default()),
                events,
            }),
        }
    }

    /// Deep copy of the current status.
    pub fn status(&self) -> ProcessingStatus {
        self.inner.lock_status().clone()
    }

    /// Receives a snapshot after every status transition.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessingStatus> {
        self.inner.events.subscribe()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.lock_status().is_processing
    }

    /// Starts processing `items` in the background, saving outputs into
    /// `destination`. Returns `None` without touching the current status if
    /// a batch is already running or no Tokio runtime is available.
    ///
    /// The handle resolves to the final status.
    pub fn start_batch(
        &self,
        items: Vec<BatchItem>,
        destination: PathBuf,
    ) -> Option<JoinHandle<ProcessingStatus>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("start_batch called outside a Tokio runtime");
            return None;
        };

        {
            let mut status = self.inner.lock_status();
            if status.is_processing {
                warn!(
                    total = status.total,
                    current_index = status.current_index,
                    "Batch already in progress; ignoring new batch"
                );
                return None;
            }
            *status = ProcessingStatus::started(&items);
            let _ = self.inner.events.send(status.clone());
        }

        info!(
            total = items.len(),
            destination = %destination.display(),
            "Batch started"
        );

        let inner = Arc::clone(&self.inner);
        Some(runtime.spawn_blocking(move || run_batch(&inner, &items, &destination)))
    }
}

/// Runs on drop, so a panic escaping the item loop still leaves a terminal
/// status behind.
struct BatchFinalizer<'a> {
    inner: &'a Inner,
}

impl Drop for BatchFinalizer<'_> {
    fn drop(&mut self) {
        self.inner.update(ProcessingStatus::finish);
    }
}

fn run_batch(inner: &Inner, items: &[BatchItem], destination: &Path) -> ProcessingStatus {
    {
        let _finalizer = BatchFinalizer { inner };
        let total = items.len();

        for (index, item) in items.iter().enumerate() {
            inner.update(|status| {
                status.current_index = index;
                status.items[index].state = ItemState::Processing;
            });
            debug!(id = %item.id, index, total, "Processing batch item");

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                process_item(&inner.processor, inner.fetcher.as_ref(), item, index, destination)
            }));

            let result = match outcome {
                Ok(result) => result.map_err(|err| format!("{err:#}")),
                Err(payload) => Err(format!(
                    "panic while processing item: {}",
                    panic_payload_to_string(payload.as_ref())
                )),
            };

            match &result {
                Ok(path) => info!(id = %item.id, index, total, path = %path.display(), "Batch item done"),
                Err(message) => warn!(id = %item.id, index, total, error = %message, "Batch item failed"),
            }

            inner.update(|status| {
                let entry = &mut status.items[index];
                match result {
                    Ok(path) => {
                        entry.state = ItemState::Done;
                        entry.output_path = Some(path);
                    }
                    Err(message) => {
                        entry.state = ItemState::Error;
                        entry.error_message = Some(message);
                    }
                }
                status.refresh_progress();
            });
        }
    }

    let status = inner.lock_status().clone();
    info!(
        total = status.total,
        failed = status.failed_count(),
        "Batch finished"
    );
    status
}

fn process_item(
    processor: &ImageProcessor,
    fetcher: &dyn Fetcher,
    item: &BatchItem,
    index: usize,
    destination: &Path,
) -> Result<PathBuf> {
    let bytes = match &item.source {
        ImageSource::Inline { data } => codec::decode_base64(data)?,
        ImageSource::Remote { url } => fetcher.download(url)?,
        ImageSource::File { path } => {
            let path = expand_home(path);
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?
        }
    };

    let spec = DimensionSpec::parse(&item.dimension)?;
    // Batches are not cancellable mid-run; the token never fires.
    let processed = processor.process_bytes(&bytes, &spec, &CancellationToken::new())?;

    let filename = output_filename(item, index, processed.format.extension());
    save_image(&processed.bytes, destination, &filename)
}

/// Sanitised `name` (else `id`, else `image-<n>`) with `ext` replacing any
/// extension the name carried.
fn output_filename(item: &BatchItem, index: usize, ext: &str) -> String {
    [item.name.as_str(), item.id.as_str()]
        .into_iter()
        .filter(|candidate| !candidate.trim().is_empty())
        .find_map(|candidate| sanitize_filename(candidate, "").ok())
        .map(|clean| {
            Path::new(&clean)
                .with_extension(ext)
                .to_string_lossy()
                .into_owned()
        })
        .unwrap_or_else(|| format!("image-{}.{ext}", index + 1))
}
