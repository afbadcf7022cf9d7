//! Input files: load from a path or URL, and admit or reject before any
//! expensive work starts.
//!
//! ## Why check magic bytes?
//!
//! A declared MIME type or a `.pdf` extension is only a claim. Checking for
//! the `%PDF` header here turns a renamed Word document into a clear
//! admission failure rather than an opaque error from pdfium halfway through
//! a batch.

use crate::config::{ExtractionConfig, PDF_MIME};
use crate::error::DiagramError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// One uploaded file, held in memory.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    /// MIME type declared by the uploader, if any.
    pub mime_type: Option<String>,
    /// Test id for question ids and page image keys; derived from the
    /// session when absent.
    pub test_id: Option<String>,
    pub data: Arc<[u8]>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Self {
            name: name.into(),
            mime_type: None,
            test_id: None,
            data: Arc::from(data),
        }
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn with_test_id(mut self, id: impl Into<String>) -> Self {
        self.test_id = Some(id.into());
        self
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Declared MIME type, else one inferred from the file extension.
    pub fn effective_mime(&self) -> Option<String> {
        self.mime_type
            .as_deref()
            .map(|m| m.split(';').next().unwrap_or(m).trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty())
            .or_else(|| mime_from_name(&self.name).map(str::to_string))
    }

    /// File name without directory or extension, for building ids.
    pub fn stem(&self) -> String {
        Path::new(&self.name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

/// MIME type for a handful of common extensions.
pub fn mime_from_name(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(PDF_MIME),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "txt" => Some("text/plain"),
        "doc" => Some("application/msword"),
        "docx" => Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
        _ => None,
    }
}

/// Decide whether `file` may enter a session.
///
/// `Err` carries a human-readable reason suitable for the file's error entry.
pub fn admit_file(file: &InputFile, config: &ExtractionConfig) -> Result<(), String> {
    let Some(mime) = file.effective_mime() else {
        return Err(format!(
            "Unsupported file type: cannot determine a type for '{}'",
            file.name
        ));
    };
    if !config.accepts_mime(&mime) {
        return Err(format!(
            "Unsupported file type '{}'; accepted: {}",
            mime,
            config.supported_mime_types.join(", ")
        ));
    }
    if file.data.is_empty() {
        return Err("File is empty".to_string());
    }
    if file.size() > config.max_file_size {
        return Err(format!(
            "File too large: {} exceeds the {} limit",
            human_size(file.size()),
            human_size(config.max_file_size)
        ));
    }
    if mime == PDF_MIME && !file.data.starts_with(b"%PDF") {
        let magic: Vec<u8> = file.data.iter().take(4).copied().collect();
        return Err(format!("Not a PDF: missing %PDF header (found {:?})", magic));
    }
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    if bytes as f64 >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load a local path or HTTP(S) URL into an [`InputFile`].
///
/// Loading does not judge the content; [`admit_file`] does that per session.
pub async fn load_input(input: &str, timeout_secs: u64) -> Result<InputFile, DiagramError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        load_local(input).await
    }
}

async fn load_local(path_str: &str) -> Result<InputFile, DiagramError> {
    let path = PathBuf::from(path_str);
    let data = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => DiagramError::PermissionDenied { path: path.clone() },
        std::io::ErrorKind::NotFound => DiagramError::FileNotFound { path: path.clone() },
        _ => DiagramError::Internal(format!("Failed to read {}: {}", path.display(), e)),
    })?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path_str.to_string());
    debug!("Loaded local file: {} ({} bytes)", path.display(), data.len());
    Ok(InputFile::new(name, data))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<InputFile, DiagramError> {
    info!("Downloading from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| DiagramError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            DiagramError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            DiagramError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(DiagramError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let name = extract_filename(url);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| DiagramError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    info!("Downloaded {} ({} bytes)", name, bytes.len());
    let mut file = InputFile::new(name, bytes.to_vec());
    // Servers often send application/octet-stream; the extension is a
    // better hint then.
    if let Some(m) = mime.filter(|m| !m.starts_with("application/octet-stream")) {
        file = file.with_mime_type(m);
    }
    Ok(file)
}

/// Extract a reasonable filename from the URL.
fn extract_filename(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "downloaded.pdf".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pdf(name: &str) -> InputFile {
        InputFile::new(name, b"%PDF-1.7\n...".to_vec())
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn mime_inferred_from_extension() {
        assert_eq!(pdf("paper.PDF").effective_mime().as_deref(), Some("application/pdf"));
        assert_eq!(InputFile::new("notes.txt", "hi").effective_mime().as_deref(), Some("text/plain"));
        assert_eq!(InputFile::new("noext", "hi").effective_mime(), None);
    }

    #[test]
    fn declared_mime_wins() {
        let f = pdf("scan.bin").with_mime_type("Application/PDF; charset=binary");
        assert_eq!(f.effective_mime().as_deref(), Some("application/pdf"));
    }

    #[test]
    fn admits_pdf() {
        assert!(admit_file(&pdf("a.pdf"), &ExtractionConfig::default()).is_ok());
    }

    #[test]
    fn rejects_wrong_type() {
        let err = admit_file(&InputFile::new("notes.txt", "hello"), &ExtractionConfig::default()).unwrap_err();
        assert!(err.contains("Unsupported file type"), "got: {err}");
    }

    #[test]
    fn rejects_oversize() {
        let config = ExtractionConfig::builder().max_file_size(4).build().unwrap();
        let err = admit_file(&pdf("big.pdf"), &config).unwrap_err();
        assert!(err.starts_with("File too large"), "got: {err}");
    }

    #[test]
    fn rejects_fake_pdf() {
        let err = admit_file(&InputFile::new("fake.pdf", "PK\x03\x04zip"), &ExtractionConfig::default())
            .unwrap_err();
        assert!(err.starts_with("Not a PDF"), "got: {err}");
    }

    #[test]
    fn rejects_empty() {
        let err = admit_file(&InputFile::new("empty.pdf", Vec::new()), &ExtractionConfig::default()).unwrap_err();
        assert_eq!(err, "File is empty");
    }

    #[test]
    fn stem_strips_extension() {
        assert_eq!(pdf("dir/paper-2024.pdf").stem(), "paper-2024");
    }

    #[test]
    fn filename_from_url() {
        assert_eq!(extract_filename("https://x.org/papers/p1.pdf"), "p1.pdf");
        assert_eq!(extract_filename("https://x.org/"), "downloaded.pdf");
    }

    #[tokio::test]
    async fn missing_local_file() {
        let err = load_input("/definitely/not/here.pdf", 5).await.unwrap_err();
        assert!(matches!(err, DiagramError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn loads_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        let f = load_input(path.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(f.name, "q.pdf");
        assert_eq!(f.size(), 8);
    }
}
