//! Extraction sessions: drive a set of files through page extraction,
//! diagram detection, geometry repair and storage.
//!
//! ## Lifecycle
//!
//! ```text
//! start_processing_session ──▶ admission (type, size, %PDF)
//!                                 │ rejected files: failed immediately
//!                                 ▼
//!                    batches of `batch_size`, each run with
//!                    buffer_unordered(`concurrency`)
//!                                 │
//!           per file: extract ──▶ per page: detect ──▶ parse ──▶ validate/sanitize
//!                                 │
//!                                 ▼
//!                    persist (optional) ──▶ completed | failed | cancelled
//! ```
//!
//! ## Why one lock for all sessions?
//!
//! Session records are small and only the orchestrator writes them. A single
//! `std::sync::Mutex` around the map is held for the few microseconds a
//! status update takes and never across an `.await`, so callbacks and status
//! readers always see a consistent snapshot.
//!
//! ## Cancellation
//!
//! Each session owns a [`CancellationToken`]. It is checked before every
//! batch, before every page and during every retry delay. Calls already in
//! flight finish, and their results are discarded. Anything a discarded or
//! failed file already wrote to the store is deleted again.
//!
//! ## Store keys
//!
//! Every file gets a test id: its own [`InputFile::test_id`], else the
//! session's test id (or the session id) for a single-file session, else
//! `{session test id}_f{index}`. Page images live under
//! `{test id}_page_{n}` and questions under `{test id}_p{n}_q{k}`.

use crate::config::ExtractionConfig;
use crate::error::{DetectError, DiagramError, ExtractError, FileError};
use crate::memory::{AllocationId, AllocationMeta, MemoryConfig, MemoryManager};
use crate::pipeline::detect::{DetectionOutput, DiagramDetector, VisionDetector};
use crate::pipeline::extract::{DocumentMetadata, PageExtractor, PageImage, PageInfo, PdfiumPageExtractor};
use crate::pipeline::input::{admit_file, InputFile};
use crate::pipeline::parse::{process_page_diagrams, DetectionResponse, ExtractedQuestion, PageDiagrams};
use crate::pipeline::store::{page_image_key, CoordinateStore, InMemoryStore};
use crate::progress::ProgressCallback;
use crate::recovery::{
    ErrorInfo, Operation, RecoveryConfig, RecoveryContext, RecoveryManager, RecoveryMethod,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Session records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Completed | FileStatus::Failed | FileStatus::Cancelled
        )
    }
}

/// Everything extracted from one completed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    pub page_count: usize,
    pub pages: Vec<PageInfo>,
    pub metadata: DocumentMetadata,
    pub questions: Vec<ExtractedQuestion>,
    pub diagrams: Vec<PageDiagrams>,
    pub warnings: Vec<String>,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub duration_ms: u64,
}

impl FileResult {
    pub fn diagram_count(&self) -> usize {
        self.diagrams.iter().map(PageDiagrams::diagram_count).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub mime_type: Option<String>,
    /// Prefix of this file's question ids and page image keys.
    pub test_id: Option<String>,
    pub status: FileStatus,
    pub result: Option<FileResult>,
    pub error: Option<FileError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FileEntry {
    pub fn pending(name: &str, size: u64, mime_type: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            size,
            mime_type,
            test_id: None,
            status: FileStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn finish(&mut self, status: FileStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub completed_steps: usize,
    pub total_steps: usize,
    pub percentage: f64,
}

impl SessionProgress {
    /// Recompute `percentage` from the step counts.
    pub fn recompute(&mut self) {
        self.percentage = if self.total_steps == 0 {
            100.0
        } else {
            self.completed_steps as f64 / self.total_steps as f64 * 100.0
        };
    }
}

/// Live state of one extraction session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSession {
    pub id: String,
    pub files: Vec<FileEntry>,
    pub progress: SessionProgress,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl ProcessingSession {
    pub fn new(id: String, files: Vec<FileEntry>) -> Self {
        let mut session = Self {
            id,
            files,
            progress: SessionProgress {
                completed_steps: 0,
                total_steps: 0,
                percentage: 0.0,
            },
            status: SessionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            errors: Vec::new(),
        };
        session.refresh_progress();
        session
    }

    /// One step per file; a step is done once the file is terminal.
    pub fn refresh_progress(&mut self) {
        self.progress.total_steps = self.files.len();
        self.progress.completed_steps = self.files.iter().filter(|f| f.status.is_terminal()).count();
        self.progress.recompute();
    }

    pub fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|f| f.status == status).count()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Per-session overrides.
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Test id of a single-file session, and the base of derived per-file
    /// test ids otherwise. Defaults to the session id.
    pub test_id: Option<String>,
    /// Overrides [`ExtractionConfig::persist_results`].
    pub persist_results: Option<bool>,
    /// Overrides [`ExtractionConfig::progress_callback`].
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("test_id", &self.test_id)
            .field("persist_results", &self.persist_results)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl SessionOptions {
    pub fn with_test_id(mut self, id: impl Into<String>) -> Self {
        self.test_id = Some(id.into());
        self
    }

    pub fn with_persist_results(mut self, persist: bool) -> Self {
        self.persist_results = Some(persist);
        self
    }

    pub fn with_progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.progress_callback = Some(cb);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedFile {
    pub name: String,
    pub result: FileResult,
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationResults {
    pub session_id: String,
    pub status: SessionStatus,
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub cancelled_files: usize,
    pub total_questions: usize,
    pub total_diagrams: usize,
    pub results: Vec<CompletedFile>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl OrchestrationResults {
    fn from_session(session: &ProcessingSession) -> Self {
        let results: Vec<CompletedFile> = session
            .files
            .iter()
            .filter(|f| f.status == FileStatus::Completed)
            .filter_map(|f| {
                f.result.as_ref().map(|r| CompletedFile {
                    name: f.name.clone(),
                    result: r.clone(),
                })
            })
            .collect();
        let end = session.end_time.unwrap_or_else(Utc::now);
        Self {
            session_id: session.id.clone(),
            status: session.status,
            total_files: session.files.len(),
            completed_files: session.count(FileStatus::Completed),
            failed_files: session.count(FileStatus::Failed),
            cancelled_files: session.count(FileStatus::Cancelled),
            total_questions: results.iter().map(|c| c.result.questions.len()).sum(),
            total_diagrams: results.iter().map(|c| c.result.diagram_count()).sum(),
            results,
            errors: session.errors.clone(),
            duration_ms: (end - session.start_time).num_milliseconds().max(0) as u64,
        }
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────

/// Cooperative cancellation flag shared by a session and its file tasks.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────

struct SessionHandle {
    session: ProcessingSession,
    token: CancellationToken,
    callback: Option<ProgressCallback>,
    done: watch::Receiver<bool>,
}

struct Inner {
    config: ExtractionConfig,
    extractor: Arc<dyn PageExtractor>,
    detector: Arc<dyn DiagramDetector>,
    fallback_detectors: RwLock<Vec<Arc<dyn DiagramDetector>>>,
    store: Option<Arc<dyn CoordinateStore>>,
    recovery: Arc<RecoveryManager>,
    memory: Arc<MemoryManager>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

/// Runs extraction sessions. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("detector", &self.inner.detector.name())
            .field("store", &self.inner.store.is_some())
            .field("sessions", &self.lock_sessions().len())
            .finish()
    }
}

/// Result of [`Orchestrator::retry_loop`].
enum Attempted<T, E> {
    Done(T),
    Failed { error: E, retries: u32 },
    Cancelled,
}

/// Store keys written for one file.
#[derive(Debug, Default)]
struct Persisted {
    page_keys: Vec<String>,
    question_ids: Vec<String>,
}

impl Persisted {
    fn is_empty(&self) -> bool {
        self.page_keys.is_empty() && self.question_ids.is_empty()
    }
}

/// What a hook should report after a state change.
enum Event {
    SessionStart,
    FileStart(usize),
    FileComplete(usize),
    FileError(usize, String),
    SessionComplete,
    Update,
}

impl Orchestrator {
    pub fn new(
        config: ExtractionConfig,
        extractor: Arc<dyn PageExtractor>,
        detector: Arc<dyn DiagramDetector>,
        store: Option<Arc<dyn CoordinateStore>>,
        recovery: Arc<RecoveryManager>,
        memory: Arc<MemoryManager>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                extractor,
                detector,
                fallback_detectors: RwLock::new(Vec::new()),
                store,
                recovery,
                memory,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Production wiring: pdfium extraction, a vision detector resolved
    /// from `config` and the environment, and an in-memory store when
    /// `persist_results` is set.
    pub fn from_config(config: ExtractionConfig) -> Result<Self, DiagramError> {
        let detector = VisionDetector::from_config(&config)?;
        let extractor = PdfiumPageExtractor::from_config(&config);
        let store: Option<Arc<dyn CoordinateStore>> = if config.persist_results {
            Some(Arc::new(InMemoryStore::new()))
        } else {
            None
        };
        let recovery = RecoveryManager::new(RecoveryConfig {
            retry_policy: config.retry_policy,
            ..RecoveryConfig::default()
        });
        Ok(Self::new(
            config,
            Arc::new(extractor),
            Arc::new(detector),
            store,
            Arc::new(recovery),
            Arc::new(MemoryManager::new(MemoryConfig::default())),
        ))
    }

    /// Add a detector tried after the primary one has exhausted its retries.
    pub fn add_fallback_detector(&self, detector: Arc<dyn DiagramDetector>) {
        if let Ok(mut list) = self.inner.fallback_detectors.write() {
            list.push(detector);
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.inner.config
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.inner.recovery
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.inner.memory
    }

    pub fn store(&self) -> Option<&Arc<dyn CoordinateStore>> {
        self.inner.store.as_ref()
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    // ── Public lifecycle ─────────────────────────────────────────────────

    /// Admit `files`, start processing them in the background and return
    /// the session id.
    ///
    /// Must be called from within a Tokio runtime. Files that fail admission
    /// are marked `failed` straight away; the rest are processed in batches.
    pub fn start_processing_session(&self, files: Vec<InputFile>, options: SessionOptions) -> String {
        let max_age = self.inner.config.session_max_age_hours;
        let removed = self.cleanup_sessions(max_age);
        if removed > 0 {
            debug!("Removed {} expired sessions", removed);
        }

        let id = Uuid::new_v4().to_string();
        let base = options.test_id.clone().unwrap_or_else(|| id.clone());
        let single = files.len() == 1;
        let mut admitted = Vec::new();
        let entries: Vec<FileEntry> = files
            .into_iter()
            .enumerate()
            .map(|(idx, file)| {
                let mut entry = FileEntry::pending(&file.name, file.size(), file.effective_mime());
                let test_id = match &file.test_id {
                    Some(own) => own.clone(),
                    None if single => base.clone(),
                    None => format!("{}_f{}", base, idx),
                };
                entry.test_id = Some(test_id.clone());
                match admit_file(&file, &self.inner.config) {
                    Ok(()) => admitted.push((idx, file, test_id)),
                    Err(reason) => {
                        warn!("Rejected {}: {}", file.name, reason);
                        entry.error = Some(FileError::Rejected {
                            name: file.name.clone(),
                            reason,
                        });
                        entry.finish(FileStatus::Failed);
                    }
                }
                entry
            })
            .collect();

        let mut session = ProcessingSession::new(id.clone(), entries);
        session.errors = session
            .files
            .iter()
            .filter_map(|f| f.error.as_ref().map(ToString::to_string))
            .collect();
        session.status = SessionStatus::Processing;

        info!(
            "Session {}: {} files, {} admitted",
            id,
            session.files.len(),
            admitted.len()
        );

        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let callback = options
            .progress_callback
            .clone()
            .or_else(|| self.inner.config.progress_callback.clone());

        self.lock_sessions().insert(
            id.clone(),
            SessionHandle {
                session,
                token: token.clone(),
                callback,
                done: done_rx,
            },
        );

        let this = self.clone();
        let session_id = id.clone();
        tokio::spawn(async move {
            this.run_session(&session_id, admitted, options, token).await;
            let _ = done_tx.send(true);
        });

        id
    }

    /// Wait until the session's background task has finished and return
    /// its final state.
    pub async fn wait_for_session(&self, id: &str) -> Result<ProcessingSession, DiagramError> {
        let mut done = self
            .lock_sessions()
            .get(id)
            .map(|h| h.done.clone())
            .ok_or_else(|| DiagramError::SessionNotFound { id: id.to_string() })?;
        let _ = done.wait_for(|d| *d).await;
        self.get_session_status(id)
            .ok_or_else(|| DiagramError::SessionNotFound { id: id.to_string() })
    }

    /// Snapshot of a session, or `None` if it is unknown.
    pub fn get_session_status(&self, id: &str) -> Option<ProcessingSession> {
        self.lock_sessions().get(id).map(|h| h.session.clone())
    }

    /// Cancel a session: every non-terminal file becomes `cancelled` and no
    /// further batches are dispatched.
    ///
    /// Returns `Ok(false)` if the session had already finished.
    pub fn cancel_session(&self, id: &str) -> Result<bool, DiagramError> {
        let (snapshot, callback) = {
            let mut sessions = self.lock_sessions();
            let handle = sessions
                .get_mut(id)
                .ok_or_else(|| DiagramError::SessionNotFound { id: id.to_string() })?;
            if handle.session.is_terminal() {
                return Ok(false);
            }
            handle.token.cancel();
            let session = &mut handle.session;
            for file in session.files.iter_mut().filter(|f| !f.status.is_terminal()) {
                file.error = Some(FileError::Cancelled {
                    name: file.name.clone(),
                });
                file.finish(FileStatus::Cancelled);
            }
            session.status = SessionStatus::Cancelled;
            session.end_time = Some(Utc::now());
            session.refresh_progress();
            (session.clone(), handle.callback.clone())
        };

        info!("Session {} cancelled", id);
        notify(callback.as_ref(), &snapshot, Event::Update);
        Ok(true)
    }

    /// Summary of a finished session; `None` while it is still running or
    /// if it is unknown.
    pub fn get_orchestration_results(&self, id: &str) -> Option<OrchestrationResults> {
        self.lock_sessions()
            .get(id)
            .filter(|h| h.session.is_terminal())
            .map(|h| OrchestrationResults::from_session(&h.session))
    }

    /// Ids of sessions that have not reached a terminal status.
    pub fn active_sessions(&self) -> Vec<String> {
        self.lock_sessions()
            .iter()
            .filter(|(_, h)| !h.session.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forget finished sessions that ended more than `max_age_hours` ago.
    ///
    /// Running sessions are never removed. Returns the number removed.
    pub fn cleanup_sessions(&self, max_age_hours: f64) -> usize {
        let max_age_ms = (max_age_hours.max(0.0) * 3_600_000.0) as i64;
        // An age reaching past the earliest representable time keeps everything.
        let Some(cutoff) = chrono::Duration::try_milliseconds(max_age_ms)
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut sessions = self.lock_sessions();
        let before = sessions.len();
        sessions.retain(|_, h| {
            let ended = h.session.end_time.filter(|_| h.session.is_terminal());
            !matches!(ended, Some(end) if end <= cutoff)
        });
        before - sessions.len()
    }

    // ── Session task ─────────────────────────────────────────────────────

    async fn run_session(
        &self,
        session_id: &str,
        admitted: Vec<(usize, InputFile, String)>,
        options: SessionOptions,
        token: CancellationToken,
    ) {
        self.update(session_id, Event::SessionStart, |_| true);

        let persist = options
            .persist_results
            .unwrap_or(self.inner.config.persist_results);
        let batch_size = self.inner.config.batch_size.max(1);
        let concurrency = self.inner.config.concurrency.max(1);

        for (batch_no, batch) in admitted.chunks(batch_size).enumerate() {
            if token.is_cancelled() {
                info!("Session {}: cancelled before batch {}", session_id, batch_no + 1);
                break;
            }
            debug!(
                "Session {}: batch {} ({} files)",
                session_id,
                batch_no + 1,
                batch.len()
            );

            stream::iter(batch.iter().cloned().map(|(idx, file, test_id)| {
                let token = token.clone();
                async move {
                    self.process_file(session_id, idx, file, &test_id, persist, &token)
                        .await
                }
            }))
            .buffer_unordered(concurrency)
            .collect::<Vec<()>>()
            .await;
        }

        self.finalize(session_id);
    }

    async fn process_file(
        &self,
        session_id: &str,
        idx: usize,
        file: InputFile,
        test_id: &str,
        persist: bool,
        token: &CancellationToken,
    ) {
        if token.is_cancelled() {
            return;
        }
        let started = self.update(session_id, Event::FileStart(idx), |s| {
            match s.files.get_mut(idx) {
                Some(entry) if entry.status == FileStatus::Pending => {
                    entry.status = FileStatus::Processing;
                    entry.started_at = Some(Utc::now());
                    true
                }
                _ => false,
            }
        });
        if !started {
            return;
        }

        info!("Processing {} ({} bytes)", file.name, file.size());
        let outcome = self.run_file(&file, test_id, persist, token).await;

        match outcome {
            Ok((result, written)) => {
                info!(
                    "{}: {} pages, {} questions, {} diagrams",
                    file.name,
                    result.page_count,
                    result.questions.len(),
                    result.diagram_count()
                );
                let kept = self.update(session_id, Event::FileComplete(idx), move |s| {
                    match s.files.get_mut(idx) {
                        Some(entry) if entry.status == FileStatus::Processing => {
                            entry.result = Some(result);
                            entry.finish(FileStatus::Completed);
                            true
                        }
                        _ => false,
                    }
                });
                if !kept {
                    debug!("{}: finished after cancellation; result discarded", file.name);
                    self.discard(&file.name, written).await;
                }
            }
            Err(error) => {
                let message = error.to_string();
                let status = if matches!(error, FileError::Cancelled { .. }) {
                    FileStatus::Cancelled
                } else {
                    warn!("{}", message);
                    FileStatus::Failed
                };
                let event = Event::FileError(idx, message.clone());
                self.update(session_id, event, move |s| {
                    match s.files.get_mut(idx) {
                        Some(entry) if entry.status == FileStatus::Processing => {
                            entry.error = Some(error);
                            entry.finish(status);
                            if status == FileStatus::Failed {
                                s.errors.push(message);
                            }
                            true
                        }
                        _ => false,
                    }
                });
            }
        }
    }

    /// Reserve memory for the file, run it, release the reservation.
    async fn run_file(
        &self,
        file: &InputFile,
        test_id: &str,
        persist: bool,
        token: &CancellationToken,
    ) -> Result<(FileResult, Persisted), FileError> {
        let reservation = self.reserve(file).await?;
        let result = self.extract_and_detect(file, test_id, persist, token).await;
        self.inner.memory.release_allocation(reservation);
        result
    }

    async fn reserve(&self, file: &InputFile) -> Result<AllocationId, FileError> {
        let memory = &self.inner.memory;
        let meta = || AllocationMeta::pinned("pdf_file");
        match memory.allocate_memory(file.size(), meta()) {
            Ok(id) => Ok(id),
            Err(e) => {
                let info = ErrorInfo::new("MEMORY_LIMIT_EXCEEDED", e.to_string())
                    .with_context("file", file.name.as_str());
                let ctx = RecoveryContext::new().with_memory(Arc::clone(memory));
                let outcome = self.inner.recovery.handle_error(info, ctx).await;
                if outcome.recovered() {
                    if let Ok(id) = memory.allocate_memory(file.size(), meta()) {
                        return Ok(id);
                    }
                }
                Err(FileError::MemoryExhausted {
                    name: file.name.clone(),
                    detail: e.to_string(),
                })
            }
        }
    }

    async fn extract_and_detect(
        &self,
        file: &InputFile,
        test_id: &str,
        persist: bool,
        token: &CancellationToken,
    ) -> Result<(FileResult, Persisted), FileError> {
        let start = Instant::now();
        let cancelled = || FileError::Cancelled {
            name: file.name.clone(),
        };

        let extractor = &self.inner.extractor;
        let doc = match self
            .retry_loop(&file.name, token, || extractor.extract(file), ExtractError::error_info)
            .await
        {
            Attempted::Done(doc) => doc,
            Attempted::Cancelled => return Err(cancelled()),
            Attempted::Failed { error, retries } => {
                debug!("{}: extraction failed after {} retries", file.name, retries);
                return Err(FileError::ExtractionFailed {
                    name: file.name.clone(),
                    detail: error.to_string(),
                });
            }
        };

        let mut questions = Vec::new();
        let mut diagrams = Vec::new();
        let mut warnings = Vec::new();
        let (mut input_tokens, mut output_tokens) = (0, 0);

        for page in &doc.pages {
            if token.is_cancelled() {
                return Err(cancelled());
            }
            let output = self.detect_page(file, page, token, &mut warnings).await?;
            input_tokens += output.input_tokens;
            output_tokens += output.output_tokens;

            let response = self.parse_response(file, page.page_number, &output.raw, &mut warnings).await;
            let processed = process_page_diagrams(
                &response,
                page.page_number,
                page.dimensions,
                test_id,
                self.inner.config.allow_overlap,
            );
            questions.extend(processed.questions);
            warnings.extend(processed.warnings);
            diagrams.push(processed.diagrams);
        }

        if token.is_cancelled() {
            return Err(cancelled());
        }
        let written = if persist {
            self.persist(file, test_id, &doc.pages, &diagrams).await?
        } else {
            Persisted::default()
        };
        if token.is_cancelled() {
            self.discard(&file.name, written).await;
            return Err(cancelled());
        }

        let result = FileResult {
            page_count: doc.page_count,
            pages: doc.page_info(),
            metadata: doc.metadata,
            questions,
            diagrams,
            warnings,
            input_tokens,
            output_tokens,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        Ok((result, written))
    }

    async fn detect_page(
        &self,
        file: &InputFile,
        page: &PageImage,
        token: &CancellationToken,
        warnings: &mut Vec<String>,
    ) -> Result<DetectionOutput, FileError> {
        let detector = &self.inner.detector;
        let (error, retries) = match self
            .retry_loop(&file.name, token, || detector.detect(page), DetectError::error_info)
            .await
        {
            Attempted::Done(output) => return Ok(output),
            Attempted::Cancelled => {
                return Err(FileError::Cancelled {
                    name: file.name.clone(),
                })
            }
            Attempted::Failed { error, retries } => (error, retries),
        };

        let info = error
            .error_info()
            .with_context("file", file.name.as_str())
            .with_context("page", page.page_number.to_string());
        let outcome = self
            .inner
            .recovery
            .handle_error(info, self.fallback_context(page))
            .await;

        let recovered = outcome.recovered();
        match outcome.value {
            Some(Value::String(raw)) if recovered => {
                warnings.push(format!(
                    "Page {}: primary detector failed ({}); used a fallback detector",
                    page.page_number, error
                ));
                Ok(DetectionOutput::new(raw))
            }
            _ => Err(FileError::DetectionFailed {
                name: file.name.clone(),
                page: page.page_number,
                retries,
                detail: error.to_string(),
            }),
        }
    }

    fn fallback_context(&self, page: &PageImage) -> RecoveryContext {
        let fallbacks = self
            .inner
            .fallback_detectors
            .read()
            .map(|l| l.clone())
            .unwrap_or_default();
        fallbacks
            .into_iter()
            .fold(RecoveryContext::new(), |ctx, detector| {
                let page = page.clone();
                let op: Operation = Arc::new(move || {
                    let detector = Arc::clone(&detector);
                    let page = page.clone();
                    async move {
                        detector
                            .detect(&page)
                            .await
                            .map(|o| Value::String(o.raw))
                            .map_err(|e| e.to_string())
                    }
                    .boxed()
                });
                ctx.with_fallback(op)
            })
    }

    /// Parse detector text, repairing or defaulting through the recovery
    /// manager when it is not valid JSON.
    async fn parse_response(
        &self,
        file: &InputFile,
        page_number: usize,
        raw: &str,
        warnings: &mut Vec<String>,
    ) -> DetectionResponse {
        if let Some(response) = DetectionResponse::parse(raw) {
            return response;
        }

        let info = ErrorInfo::new(
            "INVALID_JSON",
            format!("Page {}: detection response is not valid JSON", page_number),
        )
        .with_context("file", file.name.as_str())
        .with_context("page", page_number.to_string());
        let ctx = RecoveryContext::new()
            .with_raw_json(raw)
            .with_default(json!({"questions": [], "diagrams": []}));
        let outcome = self.inner.recovery.handle_error(info, ctx).await;

        match (outcome.method(), outcome.value) {
            (Some(RecoveryMethod::JsonAutoFix), Some(value)) => {
                debug!("Page {}: repaired malformed detection JSON", page_number);
                DetectionResponse::from_value(&value)
            }
            (_, value) => {
                warnings.push(format!(
                    "Page {}: detection response could not be parsed; no diagrams recorded",
                    page_number
                ));
                value
                    .map(|v| DetectionResponse::from_value(&v))
                    .unwrap_or_default()
            }
        }
    }

    /// Write page images, then question metadata. On a failed write
    /// everything already written for this file is deleted again.
    async fn persist(
        &self,
        file: &InputFile,
        test_id: &str,
        pages: &[PageImage],
        diagrams: &[PageDiagrams],
    ) -> Result<Persisted, FileError> {
        let mut written = Persisted::default();
        let Some(store) = self.inner.store.as_ref() else {
            return Ok(written);
        };

        match write_results(store.as_ref(), test_id, pages, diagrams, &mut written).await {
            Ok(()) => {
                debug!(
                    "{}: persisted {} pages, {} questions",
                    file.name,
                    written.page_keys.len(),
                    written.question_ids.len()
                );
                Ok(written)
            }
            Err(detail) => {
                self.discard(&file.name, written).await;
                Err(FileError::StoreFailed {
                    name: file.name.clone(),
                    detail,
                })
            }
        }
    }

    /// Delete records written for a file whose results are not kept.
    async fn discard(&self, name: &str, written: Persisted) {
        let Some(store) = self.inner.store.as_ref() else {
            return;
        };
        if written.is_empty() {
            return;
        }
        for key in &written.page_keys {
            if let Err(e) = store.delete_page_image(key).await {
                warn!("{}: could not remove page image {}: {}", name, key, e);
            }
        }
        for id in &written.question_ids {
            if let Err(e) = store.delete_coordinates(id).await {
                warn!("{}: could not remove question {}: {}", name, id, e);
            }
        }
        debug!(
            "{}: removed {} stored records",
            name,
            written.page_keys.len() + written.question_ids.len()
        );
    }

    /// Run `op` until it succeeds, fails with an unrecoverable error or runs
    /// out of retries. A call in flight when the session is cancelled runs
    /// to completion and its outcome is dropped.
    async fn retry_loop<T, E, F, Fut>(
        &self,
        label: &str,
        token: &CancellationToken,
        mut op: F,
        to_info: fn(&E) -> ErrorInfo,
    ) -> Attempted<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_retries = self.inner.config.max_retries;
        let policy = self.inner.config.retry_policy;
        let mut retries = 0;
        loop {
            let attempt = op().await;
            if token.is_cancelled() {
                debug!("{}: cancelled while a call was in flight", label);
                return Attempted::Cancelled;
            }
            match attempt {
                Ok(value) => return Attempted::Done(value),
                Err(error) => {
                    let classification = self.inner.recovery.classify(&to_info(&error));
                    if !classification.recoverable || retries >= max_retries {
                        return Attempted::Failed { error, retries };
                    }
                    retries += 1;
                    let delay = policy.delay_for(retries);
                    warn!(
                        "{}: {} ({}); retry {}/{} in {:?}",
                        label, error, classification.code, retries, max_retries, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Attempted::Cancelled,
                    }
                }
            }
        }
    }

    /// Settle the session's terminal status.
    fn finalize(&self, session_id: &str) {
        self.update(session_id, Event::SessionComplete, |s| {
            for file in s.files.iter_mut().filter(|f| !f.status.is_terminal()) {
                // Only reachable after cancellation raced a dispatch.
                file.error = Some(FileError::Cancelled {
                    name: file.name.clone(),
                });
                file.finish(FileStatus::Cancelled);
            }
            if s.status != SessionStatus::Cancelled {
                let all_failed = !s.files.is_empty() && s.count(FileStatus::Failed) == s.files.len();
                s.status = if all_failed {
                    SessionStatus::Failed
                } else {
                    SessionStatus::Completed
                };
                s.end_time = Some(Utc::now());
            }
            true
        });

        if let Some(s) = self.get_session_status(session_id) {
            info!(
                "Session {} {:?}: {} completed, {} failed, {} cancelled",
                session_id,
                s.status,
                s.count(FileStatus::Completed),
                s.count(FileStatus::Failed),
                s.count(FileStatus::Cancelled)
            );
        }
    }

    /// Apply `mutate` under the lock, then fire hooks on a snapshot outside
    /// it. Returns what `mutate` returned; hooks fire only when it is `true`.
    fn update<F>(&self, session_id: &str, event: Event, mutate: F) -> bool
    where
        F: FnOnce(&mut ProcessingSession) -> bool,
    {
        let (snapshot, callback) = {
            let mut sessions = self.lock_sessions();
            let Some(handle) = sessions.get_mut(session_id) else {
                return false;
            };
            if !mutate(&mut handle.session) {
                return false;
            }
            handle.session.refresh_progress();
            (handle.session.clone(), handle.callback.clone())
        };
        notify(callback.as_ref(), &snapshot, event);
        true
    }
}

fn notify(callback: Option<&ProgressCallback>, session: &ProcessingSession, event: Event) {
    let Some(cb) = callback else {
        return;
    };
    match event {
        Event::SessionStart => cb.on_session_start(session),
        Event::FileStart(idx) => cb.on_file_start(session, idx),
        Event::FileComplete(idx) => cb.on_file_complete(session, idx),
        Event::FileError(idx, ref msg) => cb.on_file_error(session, idx, msg),
        Event::SessionComplete => cb.on_session_complete(session),
        Event::Update => {}
    }
    cb.on_update(session);
}

async fn write_results(
    store: &dyn CoordinateStore,
    test_id: &str,
    pages: &[PageImage],
    diagrams: &[PageDiagrams],
    written: &mut Persisted,
) -> Result<(), String> {
    for page in pages {
        let png = encode_png(&page.image).map_err(|e| e.to_string())?;
        let key = page_image_key(test_id, page.page_number);
        store
            .save_page_image(&key, png)
            .await
            .map_err(|e| e.to_string())?;
        written.page_keys.push(key);
    }
    for metadata in diagrams.iter().flat_map(|p| &p.metadata) {
        store
            .save_coordinates(metadata)
            .await
            .map_err(|e| e.to_string())?;
        written.question_ids.push(metadata.question_id.clone());
    }
    Ok(())
}

fn encode_png(img: &image::DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_counts_terminal_files() {
        let mut files = vec![
            FileEntry::pending("a.pdf", 1, None),
            FileEntry::pending("b.pdf", 1, None),
            FileEntry::pending("c.pdf", 1, None),
            FileEntry::pending("d.pdf", 1, None),
        ];
        files[0].status = FileStatus::Completed;
        files[1].status = FileStatus::Failed;
        files[2].status = FileStatus::Processing;
        let s = ProcessingSession::new("s".into(), files);
        assert_eq!(s.progress.completed_steps, 2);
        assert_eq!(s.progress.total_steps, 4);
        assert_eq!(s.progress.percentage, 50.0);
    }

    #[test]
    fn empty_session_is_fully_progressed() {
        let s = ProcessingSession::new("s".into(), Vec::new());
        assert_eq!(s.progress.percentage, 100.0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!SessionStatus::Processing.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(FileStatus::Failed.is_terminal());
        assert!(!FileStatus::Pending.is_terminal());
    }

    #[test]
    fn session_serialises_camel_case() {
        let s = ProcessingSession::new("s".into(), vec![FileEntry::pending("a.pdf", 1, None)]);
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["status"], "pending");
        assert_eq!(v["progress"]["totalSteps"], 1);
        assert_eq!(v["files"][0]["status"], "pending");
        assert!(v.get("startTime").is_some());
    }

    #[tokio::test]
    async fn token_cancellation_wakes_waiters() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
        // Already cancelled: resolves immediately.
        token.cancelled().await;
    }
}
