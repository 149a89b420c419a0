pub mod progress;
pub mod queue;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::error::{Error, Result};
use crate::image::archive::TarExtractor;
use crate::image::layout::LayoutTransport;
use crate::image::manifest::{ImageConfig, Manifest};
use crate::image::{Copier, ImageRef, InspectInfo, LayerExtractor, Puller};
use crate::tree::{Layer, LayerSet};

pub use progress::{ProgressEntry, ProgressTracker};

/// Buffered progress events between a pull and the tracker.
const PROGRESS_BUFFER: usize = 256;

/// Longer timeouts are treated as this one.
const MAX_TIMEOUT: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Lifecycle of an analysis task. Transitions only move forward:
/// `New -> Pulling -> Extracting -> Analyzing -> Finished`, with `Error`
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    New,
    Pulling,
    Extracting,
    Analyzing,
    Finished,
    Error,
}

impl TaskState {
    pub fn description(self) -> &'static str {
        match self {
            TaskState::New => "Task is new",
            TaskState::Pulling => "Pulling image",
            TaskState::Extracting => "Extracting image",
            TaskState::Analyzing => "Analyzing image",
            TaskState::Finished => "Task is finished",
            TaskState::Error => "Task failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// The external pieces a task drives: pulling into local storage, copying
/// into a layout directory and reading layer archives.
#[derive(Clone)]
pub struct Collaborators {
    pub puller: Arc<dyn Puller>,
    pub copier: Arc<dyn Copier>,
    pub extractor: Arc<dyn LayerExtractor>,
}

impl Collaborators {
    /// Layout-directory transport backed by `store_root`, with tar extraction.
    pub fn layout(store_root: impl Into<PathBuf>) -> Self {
        let transport = Arc::new(LayoutTransport::new(store_root));
        Self {
            puller: transport.clone(),
            copier: transport,
            extractor: Arc::new(TarExtractor),
        }
    }
}

/// Point-in-time view of a task, as served by the task API.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub image: String,
    pub state: TaskState,
    pub description: &'static str,
    pub progress: BTreeMap<String, ProgressEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inspect_info: Option<InspectInfo>,
    /// Empty unless the task failed.
    pub error: String,
}

#[derive(Debug)]
struct TaskStatus {
    state: TaskState,
    error: Option<Error>,
    result: LayerSet,
    inspect_info: Option<InspectInfo>,
}

/// One image analysis: pull, extract, and measure every layer.
pub struct Task {
    id: String,
    image: ImageRef,
    scratch_dir: PathBuf,
    deadline: Instant,
    cancel: CancellationToken,
    started: AtomicBool,
    status: Mutex<TaskStatus>,
    progress: Mutex<ProgressTracker>,
    span: Span,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("image", &self.image.raw)
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    /// Parse `image` and allocate a scratch directory below `scratch_root`.
    /// The deadline starts counting now.
    pub fn new(
        id: impl Into<String>,
        image: &str,
        scratch_root: &Path,
        timeout: Duration,
    ) -> Result<Self> {
        let id = id.into();
        let image = ImageRef::parse(image)?;
        let scratch_dir = scratch_root.join(format!("task-{id}"));
        std::fs::create_dir_all(&scratch_dir)?;

        let span = info_span!("task", id = %id, image = %image.raw);

        Ok(Self {
            id,
            image,
            scratch_dir,
            deadline: Instant::now() + timeout.min(MAX_TIMEOUT),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            status: Mutex::new(TaskStatus {
                state: TaskState::New,
                error: None,
                result: LayerSet::new(),
                inspect_info: None,
            }),
            progress: Mutex::new(ProgressTracker::new()),
            span,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn state(&self) -> TaskState {
        self.status.lock().state
    }

    pub fn error(&self) -> Option<String> {
        self.status.lock().error.as_ref().map(ToString::to_string)
    }

    pub fn inspect_info(&self) -> Option<InspectInfo> {
        self.status.lock().inspect_info.clone()
    }

    pub fn progress(&self) -> ProgressTracker {
        self.progress.lock().clone()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let progress = self.progress.lock().entries().clone();
        let status = self.status.lock();
        TaskSnapshot {
            id: self.id.clone(),
            image: self.image.raw.clone(),
            state: status.state,
            description: status.state.description(),
            progress,
            inspect_info: status.inspect_info.clone(),
            error: status
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        }
    }

    /// The measured layers. Only available once the task has finished.
    pub fn result(&self) -> Result<LayerSet> {
        let status = self.status.lock();
        match status.state {
            TaskState::Finished => Ok(status.result.clone()),
            state => Err(Error::InvalidState(format!(
                "task {} is not finished: {}",
                self.id,
                state.description()
            ))),
        }
    }

    /// Stop any in-flight work. The task keeps its current state.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the task and remove its scratch directory.
    pub fn cleanup(&self) -> Result<()> {
        self.cancel();
        match std::fs::remove_dir_all(&self.scratch_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run the whole pipeline. Failures are recorded on the task and moved
    /// into `Error`; cancellation and deadline expiry leave the state where
    /// it was. Only a second call returns an error.
    pub async fn process(&self, collaborators: &Collaborators) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState(format!(
                "task {} has already been processed",
                self.id
            )));
        }

        let outcome = self.run(collaborators).instrument(self.span.clone()).await;
        self.span.in_scope(|| self.settle(outcome));
        Ok(())
    }

    fn settle(&self, outcome: Result<LayerSet>) {
        match outcome {
            Ok(layers) => {
                let mut status = self.status.lock();
                status.result = layers;
                status.state = TaskState::Finished;
                info!(layers = status.result.len(), "analysis finished");
            }
            Err(e) => {
                // A collaborator failing because its work was torn down
                // counts as the interruption itself.
                let e = if self.cancel.is_cancelled() {
                    Error::Cancelled
                } else if Instant::now() >= self.deadline && !e.is_abandon() {
                    Error::Timeout
                } else {
                    e
                };

                let mut status = self.status.lock();
                if e.is_abandon() {
                    warn!(state = ?status.state, reason = %e, "task abandoned");
                } else {
                    error!(state = ?status.state, error = %e, "task failed");
                    status.error = Some(e);
                    status.state = TaskState::Error;
                }
            }
        }
    }

    async fn run(&self, collaborators: &Collaborators) -> Result<LayerSet> {
        self.set_state(TaskState::Pulling);
        let info = self
            .guard(collaborators.puller.inspect(&self.image.remote))
            .await?;
        self.progress.lock().seed(info.layers.iter().cloned());
        self.status.lock().inspect_info = Some(info);

        if self.image.needs_pull() {
            self.pull(collaborators).await?;
        } else {
            debug!("image is in local storage, not pulling");
        }

        self.set_state(TaskState::Extracting);
        let manifest_bytes = self
            .guard(
                collaborators
                    .copier
                    .copy_to_layout(&self.image.local, &self.scratch_dir),
            )
            .await?;
        let manifest = Manifest::from_slice(&manifest_bytes)?;
        manifest.check_media_types()?;
        let config_path = manifest.config.digest()?.blob_path(&self.scratch_dir);
        let config = ImageConfig::from_slice(&tokio::fs::read(config_path).await?)?;

        self.set_state(TaskState::Analyzing);
        let mut layers = self.analyze(collaborators, &manifest).await?;
        merge_history(&mut layers, &manifest, &config);
        Ok(layers)
    }

    /// Pull into local storage while folding progress events into the
    /// tracker. Events are drained until the puller drops its sender.
    async fn pull(&self, collaborators: &Collaborators) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);
        let pull = self.guard(
            collaborators
                .puller
                .pull(&self.image.remote, &self.image.local, tx),
        );
        let drain = async {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => {
                            self.progress.lock().apply(&event);
                        }
                        None => break,
                    },
                    _ = self.interrupted() => break,
                }
            }
        };

        let (result, ()) = tokio::join!(pull, drain);
        result
    }

    async fn analyze(&self, collaborators: &Collaborators, manifest: &Manifest) -> Result<LayerSet> {
        let mut blobs = Vec::with_capacity(manifest.layers.len());
        for descriptor in &manifest.layers {
            let digest = descriptor.digest()?;
            blobs.push((digest.hex().to_string(), digest.blob_path(&self.scratch_dir)));
        }

        let extractor = Arc::clone(&collaborators.extractor);
        let span = Span::current();
        let work = tokio::task::spawn_blocking(move || -> Result<LayerSet> {
            let _enter = span.enter();
            let mut layers = LayerSet::new();
            for (digest, blob) in blobs {
                let mut layer = Layer::new();
                let mut whiteouts = 0usize;
                extractor.for_each_entry(&blob, &mut |entry| {
                    whiteouts += usize::from(entry.is_whiteout);
                    layer.insert(&entry.path, entry.size);
                })?;
                debug!(%digest, size = layer.total_size(), whiteouts, "layer measured");
                layers.insert(digest, layer);
            }
            Ok(layers)
        });

        self.guard(async { work.await.map_err(|e| Error::Io(std::io::Error::other(e)))? })
            .await
    }

    /// Race `fut` against cancellation and the task deadline.
    async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            e = self.interrupted() => Err(e),
            result = fut => result,
        }
    }

    async fn interrupted(&self) -> Error {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Error::Cancelled,
            _ = tokio::time::sleep_until(self.deadline) => Error::Timeout,
        }
    }

    fn set_state(&self, state: TaskState) {
        let mut status = self.status.lock();
        debug!(from = ?status.state, to = ?state, "state transition");
        status.state = state;
    }
}

/// Attach the command that created each layer, matched by position between
/// the manifest layers and the non-empty history entries.
fn merge_history(layers: &mut LayerSet, manifest: &Manifest, config: &ImageConfig) {
    let commands = config.layer_commands();
    if commands.len() != manifest.layers.len() {
        warn!(
            layers = manifest.layers.len(),
            history = commands.len(),
            "layer history does not match the manifest"
        );
    }

    let mut created_by = BTreeMap::new();
    for (descriptor, command) in manifest.layers.iter().zip(&commands) {
        if let (Ok(digest), Some(command)) = (descriptor.digest(), command) {
            created_by.insert(digest.hex().to_string(), command.to_string());
        }
    }

    for (digest, command) in created_by {
        match layers.get_mut(&digest) {
            Some(layer) => layer.created_by = command,
            None => warn!(%digest, "history entry has no extracted layer"),
        }
    }
    for (digest, layer) in layers.iter() {
        if layer.created_by.is_empty() {
            warn!(%digest, "extracted layer has no history entry");
        }
    }
}
