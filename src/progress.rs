//! Progress-callback trait for session events.
//!
//! Inject an [`Arc<dyn SessionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] (or per
//! session through [`crate::session::SessionOptions`]) to observe a session
//! while it runs.
//!
//! Every hook receives a snapshot of the live [`ProcessingSession`], taken
//! after the change it reports. Hooks run on the session task, outside any
//! internal lock, so they may call back into the orchestrator.
//!
//! # Example
//!
//! ```rust
//! use edgequake_diagrams::{ProcessingSession, SessionProgressCallback, ExtractionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     finished: AtomicUsize,
//! }
//!
//! impl SessionProgressCallback for CountingCallback {
//!     fn on_file_complete(&self, session: &ProcessingSession, file_index: usize) {
//!         self.finished.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{} done ({:.0}%)", session.files[file_index].name, session.progress.percentage);
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { finished: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::session::ProcessingSession;
use std::sync::Arc;

/// Called by the orchestrator as a session advances.
///
/// All methods have default no-op implementations; callers only override
/// what they care about. [`on_update`](Self::on_update) fires after every
/// change, including the ones that also fire a specific hook.
///
/// # Thread safety
///
/// Files inside a batch run concurrently, so `on_file_start`,
/// `on_file_complete` and `on_file_error` may interleave. Protect shared
/// mutable state with `Mutex` or atomics.
pub trait SessionProgressCallback: Send + Sync {
    /// Any change to the session.
    fn on_update(&self, session: &ProcessingSession) {
        let _ = session;
    }

    /// Called once after admission, before the first batch is dispatched.
    fn on_session_start(&self, session: &ProcessingSession) {
        let _ = session;
    }

    /// Called when a file enters `processing`.
    fn on_file_start(&self, session: &ProcessingSession, file_index: usize) {
        let _ = (session, file_index);
    }

    /// Called when a file reaches `completed`.
    fn on_file_complete(&self, session: &ProcessingSession, file_index: usize) {
        let _ = (session, file_index);
    }

    /// Called when a file reaches `failed`, including admission rejections.
    fn on_file_error(&self, session: &ProcessingSession, file_index: usize, error: &str) {
        let _ = (session, file_index, error);
    }

    /// Called once when the session reaches a terminal status.
    fn on_session_complete(&self, session: &ProcessingSession) {
        let _ = session;
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl SessionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn SessionProgressCallback>;
