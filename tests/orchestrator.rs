//! Session orchestration tests with scripted extractors and detectors.
//!
//! No pdfium and no network: the extractor hands back blank pages and the
//! detectors return canned JSON or canned failures, so every path through
//! retries, recovery and cancellation is deterministic.
//!
//! Run with:
//!   cargo test --test orchestrator

use async_trait::async_trait;
use edgequake_diagrams::error::{DetectError, ExtractError, FileError, StoreError};
use edgequake_diagrams::pipeline::{
    apply_user_edit, page_image_key, DetectionOutput, DocumentMetadata, ExtractedDocument,
};
use edgequake_diagrams::recovery::RecoveryMethod;
use edgequake_diagrams::render::RenderedDiagram;
use edgequake_diagrams::{
    CoordinateMetadata, CoordinateStore, DiagramCoordinates, DiagramDetector, DiagramRenderer, ExtractionConfig,
    FileStatus, InMemoryStore, InputFile, MemoryConfig, MemoryManager, ModifiedBy, Orchestrator,
    PageExtractor, PageImage, ProcessingSession, RecoveryManager, RenderOptions, SessionOptions,
    SessionProgressCallback, SessionStatus, SourceImage,
};
use image::{DynamicImage, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Test helpers ─────────────────────────────────────────────────────────────

const ONE_DIAGRAM: &str = r#"{
  "questions": [{"number": "1", "text": "Find the area of the triangle."}],
  "diagrams": [{"coordinates": {"x1": 20, "y1": 10, "x2": 120, "y2": 80},
                "type": "geometry", "confidence": 0.9, "questionNumber": "1"}]
}"#;

fn pdf(name: &str) -> InputFile {
    InputFile::new(name, b"%PDF-1.4 scripted".to_vec())
}

/// Extractor returning `pages` blank 200×100 pages; inputs whose bytes
/// contain `broken` fail as corrupt.
struct BlankPages {
    pages: usize,
    calls: AtomicUsize,
}

impl BlankPages {
    fn new(pages: usize) -> Arc<Self> {
        Arc::new(Self {
            pages,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PageExtractor for BlankPages {
    async fn extract(&self, file: &InputFile) -> Result<ExtractedDocument, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if file.data.windows(6).any(|w| w == b"broken") {
            return Err(ExtractError::Corrupt("xref table missing".into()));
        }
        let pages = (1..=self.pages)
            .map(|n| {
                let img = DynamicImage::ImageRgb8(RgbImage::new(200, 100));
                PageImage::new(n, img, format!("Question {n}")).unwrap()
            })
            .collect();
        Ok(ExtractedDocument::from_pages(pages, DocumentMetadata::default()))
    }
}

enum Script {
    Reply(&'static str),
    Fail(fn() -> DetectError),
    /// Answer the first `n` calls at once, later ones after `delay_ms`.
    ReplyThenStall(usize, u64, &'static str),
}

struct ScriptedDetector {
    name: &'static str,
    script: Script,
    calls: AtomicUsize,
    returned: AtomicUsize,
}

impl ScriptedDetector {
    fn new(name: &'static str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            name,
            script,
            calls: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that ran to completion.
    fn returned(&self) -> usize {
        self.returned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagramDetector for ScriptedDetector {
    fn name(&self) -> &str {
        self.name
    }

    async fn detect(&self, _page: &PageImage) -> Result<DetectionOutput, DetectError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = match &self.script {
            Script::Reply(raw) => Ok(DetectionOutput::new(*raw)),
            Script::Fail(make) => Err(make()),
            Script::ReplyThenStall(n, delay_ms, raw) => {
                if call >= *n {
                    tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                }
                Ok(DetectionOutput::new(*raw))
            }
        };
        self.returned.fetch_add(1, Ordering::SeqCst);
        reply
    }
}

/// In-memory store whose `save_coordinates` fails after `ok_writes` writes.
struct FlakyStore {
    inner: InMemoryStore,
    ok_writes: usize,
    writes: AtomicUsize,
}

impl FlakyStore {
    fn new(ok_writes: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::new(),
            ok_writes,
            writes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CoordinateStore for FlakyStore {
    async fn save_coordinates(&self, metadata: &CoordinateMetadata) -> Result<(), StoreError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) >= self.ok_writes {
            return Err(StoreError::Backend("disk full".into()));
        }
        self.inner.save_coordinates(metadata).await
    }

    async fn get_coordinates(
        &self,
        question_id: &str,
    ) -> Result<Option<CoordinateMetadata>, StoreError> {
        self.inner.get_coordinates(question_id).await
    }

    async fn delete_coordinates(&self, question_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_coordinates(question_id).await
    }

    async fn save_page_image(&self, key: &str, png: Vec<u8>) -> Result<(), StoreError> {
        self.inner.save_page_image(key, png).await
    }

    async fn get_page_image(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get_page_image(key).await
    }

    async fn delete_page_image(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete_page_image(key).await
    }

    async fn save_render(&self, key: &str, render: &RenderedDiagram) -> Result<(), StoreError> {
        self.inner.save_render(key, render).await
    }

    async fn get_render(&self, key: &str) -> Result<Option<RenderedDiagram>, StoreError> {
        self.inner.get_render(key).await
    }
}

fn config(batch_size: usize, concurrency: usize) -> ExtractionConfig {
    ExtractionConfig::builder()
        .batch_size(batch_size)
        .concurrency(concurrency)
        .max_retries(1)
        .retry_delay_ms(1)
        .build()
        .unwrap()
}

fn orchestrator(
    config: ExtractionConfig,
    extractor: Arc<dyn PageExtractor>,
    detector: Arc<dyn DiagramDetector>,
    store: Option<Arc<dyn CoordinateStore>>,
) -> Orchestrator {
    Orchestrator::new(
        config,
        extractor,
        detector,
        store,
        Arc::new(RecoveryManager::default()),
        Arc::new(MemoryManager::default()),
    )
}

/// Session logs under `RUST_LOG=debug cargo test -- --nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn run(orch: &Orchestrator, files: Vec<InputFile>) -> ProcessingSession {
    init_tracing();
    let id = orch.start_processing_session(files, SessionOptions::default());
    tokio::time::timeout(Duration::from_secs(10), orch.wait_for_session(&id))
        .await
        .expect("session did not finish")
        .unwrap()
}

async fn wait_until(orch: &Orchestrator, id: &str, cond: impl Fn(&ProcessingSession) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if orch.get_session_status(id).is_some_and(|s| cond(&s)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// ── Batching and admission ───────────────────────────────────────────────────

#[tokio::test]
async fn mixed_batch_completes_pdfs_and_rejects_text() {
    let extractor = BlankPages::new(2);
    let detector = ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM));
    let orch = orchestrator(config(2, 2), extractor.clone(), detector.clone(), None);

    let files = vec![
        pdf("a.pdf"),
        pdf("b.pdf"),
        InputFile::new("notes.txt", "plain text"),
        pdf("c.pdf"),
    ];
    let session = run(&orch, files).await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.count(FileStatus::Completed), 3);
    assert_eq!(session.count(FileStatus::Failed), 1);
    assert_eq!(session.files[2].status, FileStatus::Failed);
    assert!(matches!(
        session.files[2].error,
        Some(FileError::Rejected { .. })
    ));
    assert_eq!(session.progress.percentage, 100.0);
    assert_eq!(session.errors.len(), 1);
    assert!(session.end_time.is_some());

    // The rejected file never reached the extractor.
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
    assert_eq!(detector.calls(), 6);

    let results = orch.get_orchestration_results(&session.id).unwrap();
    assert_eq!(results.total_files, 4);
    assert_eq!(results.completed_files, 3);
    assert_eq!(results.failed_files, 1);
    assert_eq!(results.results.len(), 3);
    assert_eq!(results.total_questions, 6);
    assert_eq!(results.total_diagrams, 6);
}

#[tokio::test]
async fn session_with_only_rejected_files_fails() {
    let orch = orchestrator(
        config(3, 3),
        BlankPages::new(1),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        None,
    );
    let session = run(&orch, vec![InputFile::new("scan.docx", "PK")]).await;
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.count(FileStatus::Failed), 1);
}

#[tokio::test]
async fn detected_boxes_become_question_metadata() {
    let orch = orchestrator(
        config(1, 1),
        BlankPages::new(1),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        None,
    );
    let id = orch.start_processing_session(
        vec![pdf("paper.pdf")],
        SessionOptions::default().with_test_id("t1"),
    );
    let session = orch.wait_for_session(&id).await.unwrap();

    let result = session.files[0].result.as_ref().unwrap();
    assert_eq!(result.page_count, 1);
    assert_eq!(result.questions[0].id, "t1_p1_q1");
    assert!(result.questions[0].has_diagram);

    let meta = &result.diagrams[0].metadata[0];
    assert_eq!(meta.question_id, "t1_p1_q1");
    assert_eq!(meta.diagrams[0].id, "t1_p1_q1_diagram_1");
    assert_eq!(session.files[0].test_id.as_deref(), Some("t1"));
    assert_eq!(meta.diagrams[0].modified_by, ModifiedBy::Ai);
    assert_eq!(meta.original_image_dimensions.width, 200);
}

// ── Persistence ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn results_are_persisted_and_editable() {
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(
        config(1, 1),
        BlankPages::new(2),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        Some(store.clone() as Arc<dyn CoordinateStore>),
    );
    let id = orch.start_processing_session(
        vec![pdf("paper.pdf")],
        SessionOptions::default().with_test_id("exam"),
    );
    let session = orch.wait_for_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    assert_eq!(store.page_image_count().await, 2);
    let png = store
        .get_page_image(&page_image_key("exam", 1))
        .await
        .unwrap()
        .unwrap();
    assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));
    assert_eq!(
        store.question_ids().await,
        vec!["exam_p1_q1".to_string(), "exam_p2_q1".to_string()]
    );

    let edited = DiagramCoordinates::new(12.0, 13.0, 260.0, 90.0);
    let meta = apply_user_edit(
        store.as_ref(),
        "exam_p1_q1",
        "exam_p1_q1_diagram_1",
        &edited,
    )
    .await
    .unwrap();
    let record = &meta.diagrams[0];
    assert_eq!(record.modified_by, ModifiedBy::User);
    assert!(record.coordinates.x2 <= 200.0);
}

#[tokio::test]
async fn multi_file_sessions_derive_a_test_id_per_file() {
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(
        config(2, 2),
        BlankPages::new(1),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        Some(store.clone() as Arc<dyn CoordinateStore>),
    );
    let files = vec![pdf("a.pdf"), pdf("b.pdf").with_test_id("biology")];
    let id = orch.start_processing_session(files, SessionOptions::default().with_test_id("T2"));
    let session = orch.wait_for_session(&id).await.unwrap();

    assert_eq!(session.files[0].test_id.as_deref(), Some("T2_f0"));
    assert_eq!(session.files[1].test_id.as_deref(), Some("biology"));
    for key in [page_image_key("T2_f0", 1), page_image_key("biology", 1)] {
        assert!(store.get_page_image(&key).await.unwrap().is_some(), "{key}");
    }
    assert_eq!(
        store.question_ids().await,
        vec!["T2_f0_p1_q1".to_string(), "biology_p1_q1".to_string()]
    );
}

#[tokio::test]
async fn failed_store_write_leaves_nothing_behind() {
    let store = FlakyStore::new(1);
    let orch = orchestrator(
        config(1, 1),
        BlankPages::new(2),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        Some(store.clone() as Arc<dyn CoordinateStore>),
    );
    let id = orch.start_processing_session(
        vec![pdf("paper.pdf")],
        SessionOptions::default().with_test_id("exam"),
    );
    let session = orch.wait_for_session(&id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Failed);
    assert!(matches!(
        session.files[0].error,
        Some(FileError::StoreFailed { .. })
    ));
    assert!(session.files[0].result.is_none());
    // Both page images and the first question were written, then removed.
    assert_eq!(store.inner.page_image_count().await, 0);
    assert!(store.inner.question_ids().await.is_empty());
}

#[tokio::test]
async fn persistence_can_be_switched_off_per_session() {
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(
        config(1, 1),
        BlankPages::new(1),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        Some(store.clone() as Arc<dyn CoordinateStore>),
    );
    let id = orch.start_processing_session(
        vec![pdf("paper.pdf")],
        SessionOptions::default().with_persist_results(false),
    );
    orch.wait_for_session(&id).await.unwrap();
    assert_eq!(store.page_image_count().await, 0);
    assert!(store.question_ids().await.is_empty());
}

// ── Retries and recovery ─────────────────────────────────────────────────────

#[tokio::test]
async fn network_failure_uses_fallback_detector() {
    let primary = ScriptedDetector::new(
        "primary",
        Script::Fail(|| DetectError::Network("connection reset by peer".into())),
    );
    let fallback = ScriptedDetector::new("backup", Script::Reply(ONE_DIAGRAM));
    let orch = orchestrator(config(1, 1), BlankPages::new(1), primary.clone(), None);
    orch.add_fallback_detector(fallback.clone());

    let session = run(&orch, vec![pdf("a.pdf")]).await;
    assert_eq!(session.files[0].status, FileStatus::Completed);
    // One call plus one retry.
    assert_eq!(primary.calls(), 2);
    assert_eq!(fallback.calls(), 1);

    let result = session.files[0].result.as_ref().unwrap();
    assert_eq!(result.diagram_count(), 1);
    assert!(result.warnings.iter().any(|w| w.contains("fallback")));

    let history = orch.recovery().history();
    let attempt = history.last().unwrap();
    assert_eq!(attempt.classification.code, "CONNECTION_FAILED");
    assert!(attempt.classification.recoverable);
    assert_eq!(
        attempt.steps.last().map(|s| s.method),
        Some(RecoveryMethod::Fallback)
    );
}

#[tokio::test]
async fn unauthorized_is_not_retried() {
    let primary = ScriptedDetector::new(
        "primary",
        Script::Fail(|| DetectError::Unauthorized {
            status: 401,
            detail: "invalid api key".into(),
        }),
    );
    let orch = orchestrator(config(1, 1), BlankPages::new(1), primary.clone(), None);

    let session = run(&orch, vec![pdf("a.pdf")]).await;
    assert_eq!(primary.calls(), 1);
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(matches!(
        session.files[0].error,
        Some(FileError::DetectionFailed { page: 1, retries: 0, .. })
    ));

    let attempt = orch.recovery().history().pop().unwrap();
    assert_eq!(attempt.classification.code, "UNAUTHORIZED");
    assert!(!attempt.classification.recoverable);
}

#[tokio::test]
async fn corrupt_pdf_fails_without_retry() {
    let extractor = BlankPages::new(1);
    let orch = orchestrator(
        config(1, 1),
        extractor.clone(),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        None,
    );
    let broken = InputFile::new("broken.pdf", b"%PDF-1.4 broken".to_vec());
    let session = run(&orch, vec![broken, pdf("ok.pdf")]).await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.files[0].status, FileStatus::Failed);
    assert!(matches!(
        session.files[0].error,
        Some(FileError::ExtractionFailed { .. })
    ));
    assert_eq!(session.files[1].status, FileStatus::Completed);
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_json_is_repaired() {
    const FENCED: &str = "```json\n{\"questions\": [{\"number\": \"1\", \"text\": \"Q\"},],\n\
        \"diagrams\": [{\"bbox\": [20, 10, 120, 80], \"type\": \"graph\",},],}\n```";
    let orch = orchestrator(
        config(1, 1),
        BlankPages::new(1),
        ScriptedDetector::new("primary", Script::Reply(FENCED)),
        None,
    );
    let session = run(&orch, vec![pdf("a.pdf")]).await;
    let result = session.files[0].result.as_ref().unwrap();
    assert_eq!(result.diagram_count(), 1);
    assert_eq!(result.questions.len(), 1);

    let stats = orch.recovery().stats();
    assert_eq!(stats.by_code.get("INVALID_JSON"), Some(&1));
    assert_eq!(stats.recovered_errors, 1);
}

#[tokio::test]
async fn unreadable_response_records_no_diagrams() {
    let orch = orchestrator(
        config(1, 1),
        BlankPages::new(1),
        ScriptedDetector::new("primary", Script::Reply("I could not find any diagrams.")),
        None,
    );
    let session = run(&orch, vec![pdf("a.pdf")]).await;
    assert_eq!(session.files[0].status, FileStatus::Completed);
    let result = session.files[0].result.as_ref().unwrap();
    assert_eq!(result.diagram_count(), 0);
    assert!(result.warnings.iter().any(|w| w.contains("could not be parsed")));
}

#[tokio::test]
async fn memory_limit_fails_the_file() {
    let memory = Arc::new(MemoryManager::new(MemoryConfig {
        heap_limit: 8,
        ..MemoryConfig::default()
    }));
    let orch = Orchestrator::new(
        config(1, 1),
        BlankPages::new(1),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        None,
        Arc::new(RecoveryManager::default()),
        memory.clone(),
    );
    let session = run(&orch, vec![pdf("a.pdf")]).await;
    assert!(matches!(
        session.files[0].error,
        Some(FileError::MemoryExhausted { .. })
    ));
    assert!(memory.allocations().is_empty());

    let attempt = orch.recovery().history().pop().unwrap();
    assert_eq!(attempt.classification.code, "MEMORY_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn reservations_are_released_after_success() {
    let orch = orchestrator(
        config(2, 2),
        BlankPages::new(1),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        None,
    );
    run(&orch, vec![pdf("a.pdf"), pdf("b.pdf")]).await;
    assert!(orch.memory().allocations().is_empty());
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_keeps_finished_files_and_cancels_the_rest() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let detector = ScriptedDetector::new("primary", Script::ReplyThenStall(1, 200, ONE_DIAGRAM));
    let orch = orchestrator(
        config(1, 1),
        BlankPages::new(1),
        detector.clone(),
        Some(store.clone() as Arc<dyn CoordinateStore>),
    );
    let id = orch.start_processing_session(
        vec![pdf("a.pdf"), pdf("b.pdf"), pdf("c.pdf")],
        SessionOptions::default().with_test_id("c"),
    );

    // The second file is inside the slow detector call.
    wait_until(&orch, &id, |s| {
        s.files[0].status == FileStatus::Completed
            && s.files[1].status == FileStatus::Processing
            && detector.calls() == 2
    })
    .await;
    assert_eq!(orch.active_sessions(), vec![id.clone()]);
    assert!(orch.get_orchestration_results(&id).is_none());

    assert!(orch.cancel_session(&id).unwrap());
    let session = tokio::time::timeout(Duration::from_secs(5), orch.wait_for_session(&id))
        .await
        .expect("cancelled session did not settle")
        .unwrap();

    // The in-flight call finished; its result was dropped.
    assert_eq!(detector.returned(), 2);
    assert_eq!(detector.calls(), 2);
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert_eq!(session.files[0].status, FileStatus::Completed);
    assert!(session.files[0].result.is_some());
    assert_eq!(session.files[1].status, FileStatus::Cancelled);
    assert!(session.files[1].result.is_none());
    assert_eq!(session.files[2].status, FileStatus::Cancelled);
    assert_eq!(store.question_ids().await, vec!["c_f0_p1_q1".to_string()]);
    assert!(store
        .get_page_image(&page_image_key("c_f1", 1))
        .await
        .unwrap()
        .is_none());

    let results = orch.get_orchestration_results(&id).unwrap();
    assert_eq!(results.completed_files, 1);
    assert_eq!(results.cancelled_files, 2);
    assert_eq!(results.results.len(), 1);

    // Already terminal.
    assert!(!orch.cancel_session(&id).unwrap());
    assert!(orch.active_sessions().is_empty());
}

#[tokio::test]
async fn unknown_session_ids() {
    let orch = orchestrator(
        config(1, 1),
        BlankPages::new(1),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        None,
    );
    assert!(orch.get_session_status("nope").is_none());
    assert!(orch.wait_for_session("nope").await.is_err());
    assert!(orch.cancel_session("nope").is_err());
}

#[tokio::test]
async fn cleanup_drops_finished_sessions() {
    let orch = orchestrator(
        config(1, 1),
        BlankPages::new(1),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        None,
    );
    let session = run(&orch, vec![pdf("a.pdf")]).await;
    assert_eq!(orch.cleanup_sessions(24.0), 0);
    // Ages beyond the representable range keep everything.
    assert_eq!(orch.cleanup_sessions(1e12), 0);
    assert_eq!(orch.cleanup_sessions(f64::INFINITY), 0);
    assert_eq!(orch.cleanup_sessions(0.0), 1);
    assert!(orch.get_session_status(&session.id).is_none());
}

// ── Progress callbacks ───────────────────────────────────────────────────────

#[derive(Default)]
struct Counting {
    starts: AtomicUsize,
    file_starts: AtomicUsize,
    completes: AtomicUsize,
    errors: AtomicUsize,
    finished: AtomicUsize,
    updates: AtomicUsize,
}

impl SessionProgressCallback for Counting {
    fn on_update(&self, _session: &ProcessingSession) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }
    fn on_session_start(&self, _session: &ProcessingSession) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }
    fn on_file_start(&self, session: &ProcessingSession, file_index: usize) {
        assert_eq!(session.files[file_index].status, FileStatus::Processing);
        self.file_starts.fetch_add(1, Ordering::SeqCst);
    }
    fn on_file_complete(&self, session: &ProcessingSession, file_index: usize) {
        assert!(session.files[file_index].result.is_some());
        self.completes.fetch_add(1, Ordering::SeqCst);
    }
    fn on_file_error(&self, _session: &ProcessingSession, _file_index: usize, _error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
    fn on_session_complete(&self, session: &ProcessingSession) {
        assert!(session.is_terminal());
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn callbacks_follow_the_session() {
    let cb = Arc::new(Counting::default());
    let orch = orchestrator(
        config(2, 2),
        BlankPages::new(1),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        None,
    );
    let id = orch.start_processing_session(
        vec![pdf("a.pdf"), pdf("b.pdf"), InputFile::new("bad.pdf", "nope")],
        SessionOptions::default().with_progress_callback(cb.clone()),
    );
    orch.wait_for_session(&id).await.unwrap();

    assert_eq!(cb.starts.load(Ordering::SeqCst), 1);
    assert_eq!(cb.file_starts.load(Ordering::SeqCst), 2);
    assert_eq!(cb.completes.load(Ordering::SeqCst), 2);
    // Admission rejections are recorded before the session starts.
    assert_eq!(cb.errors.load(Ordering::SeqCst), 0);
    assert_eq!(cb.finished.load(Ordering::SeqCst), 1);
    assert_eq!(cb.updates.load(Ordering::SeqCst), 6);
}

// ── Rendering from stored pages ──────────────────────────────────────────────

#[tokio::test]
async fn renders_detected_diagram_and_hits_cache() {
    let orch = orchestrator(
        config(1, 1),
        BlankPages::new(1),
        ScriptedDetector::new("primary", Script::Reply(ONE_DIAGRAM)),
        None,
    );
    let session = run(&orch, vec![pdf("a.pdf")]).await;
    let coords = session.files[0].result.as_ref().unwrap().diagrams[0].metadata[0].diagrams[0]
        .coordinates
        .clone();

    let renderer = DiagramRenderer::new(4);
    let page = SourceImage::new("a_page_1", DynamicImage::ImageRgb8(RgbImage::new(200, 100)));
    let options = RenderOptions::default();

    let first = renderer.render_diagram(&page, &coords, &options).unwrap();
    assert!(!first.from_cache);
    assert!(first.image_data.starts_with("data:image/png;base64,"));
    assert_eq!(first.dimensions.width, 100);
    assert_eq!(first.dimensions.height, 70);

    let second = renderer.render_diagram(&page, &coords, &options).unwrap();
    assert!(second.from_cache);
    assert_eq!(renderer.stats().cache_hits, 1);
}
