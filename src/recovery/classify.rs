//! Error classification: map an error code, HTTP status or bare message to a
//! category, a severity and a recoverable flag.
//!
//! Lookup order: known error code, then HTTP status, then keywords in the
//! message. Anything that matches nothing is `System`/`Medium` and not
//! recoverable.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Broad family an error belongs to. Drives the recovery strategy list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Network,
    File,
    Processing,
    Validation,
    Memory,
    Security,
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::File => "file",
            ErrorCategory::Processing => "processing",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Memory => "memory",
            ErrorCategory::Security => "security",
            ErrorCategory::System => "system",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// An error as reported to the recovery layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Error code such as `RATE_LIMITED`; free text is allowed.
    pub error_type: String,
    pub message: String,
    /// HTTP status when the error came from an API response.
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            status: None,
            context: HashMap::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Result of classifying one error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorClassification {
    pub code: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
    pub user_message: String,
}

struct CodeEntry {
    code: &'static str,
    category: ErrorCategory,
    severity: Severity,
    recoverable: bool,
    user_message: &'static str,
}

const fn entry(
    code: &'static str,
    category: ErrorCategory,
    severity: Severity,
    recoverable: bool,
    user_message: &'static str,
) -> CodeEntry {
    CodeEntry {
        code,
        category,
        severity,
        recoverable,
        user_message,
    }
}

use ErrorCategory::*;
use Severity::*;

static CODE_TABLE: &[CodeEntry] = &[
    // ── Network ──
    entry("CONNECTION_FAILED", Network, Medium, true, "Could not reach the server. Retrying."),
    entry("NETWORK_ERROR", Network, Medium, true, "A network error occurred. Retrying."),
    entry("TIMEOUT", Network, Medium, true, "The request timed out. Retrying."),
    entry("RATE_LIMITED", Network, Medium, true, "Too many requests. Waiting before retrying."),
    entry("SERVER_ERROR", Network, High, true, "The server reported an error. Retrying."),
    // ── Security ──
    entry("UNAUTHORIZED", Security, High, false, "Authentication failed. Check your API key."),
    entry("FORBIDDEN", Security, High, false, "Access to this resource is forbidden."),
    entry("PERMISSION_DENIED", Security, High, false, "Permission denied."),
    // ── File ──
    entry("FILE_NOT_FOUND", File, High, false, "The file could not be found."),
    entry("FILE_TOO_LARGE", File, Medium, false, "The file is too large to process."),
    entry("UNSUPPORTED_FORMAT", File, Medium, false, "This file type is not supported. Upload a PDF."),
    entry("CORRUPTED_FILE", File, High, false, "The file appears to be corrupted."),
    entry("FILE_READ_ERROR", File, Medium, true, "The file could not be read. Retrying."),
    // ── Processing ──
    entry("PDF_PARSE_ERROR", Processing, High, true, "The PDF could not be parsed."),
    entry("EXTRACTION_FAILED", Processing, High, true, "Page extraction failed."),
    entry("AI_PROCESSING_FAILED", Processing, High, true, "Diagram detection failed."),
    // ── Validation ──
    entry("INVALID_JSON", Validation, Medium, true, "The detection response was malformed. Attempting repair."),
    entry("INVALID_COORDINATES", Validation, Medium, true, "Diagram coordinates were invalid and have been adjusted."),
    entry("MISSING_REQUIRED_FIELD", Validation, Low, true, "A required field was missing."),
    // ── Memory ──
    entry("OUT_OF_MEMORY", Memory, Critical, true, "The system ran out of memory. Freeing resources."),
    entry("MEMORY_LIMIT_EXCEEDED", Memory, High, true, "Memory limit reached. Freeing resources."),
    // ── System ──
    entry("UNKNOWN_ERROR", System, Medium, false, "An unexpected error occurred."),
];

fn lookup(code: &str) -> Option<&'static CodeEntry> {
    CODE_TABLE.iter().find(|e| e.code == code)
}

fn from_entry(e: &CodeEntry) -> ErrorClassification {
    ErrorClassification {
        code: e.code.to_string(),
        category: e.category,
        severity: e.severity,
        recoverable: e.recoverable,
        user_message: e.user_message.to_string(),
    }
}

/// Error code for an HTTP status, if the status is an error.
pub fn code_for_status(status: u16) -> Option<&'static str> {
    match status {
        401 => Some("UNAUTHORIZED"),
        403 => Some("FORBIDDEN"),
        404 => Some("FILE_NOT_FOUND"),
        408 | 504 => Some("TIMEOUT"),
        413 => Some("FILE_TOO_LARGE"),
        415 => Some("UNSUPPORTED_FORMAT"),
        429 => Some("RATE_LIMITED"),
        500..=599 => Some("SERVER_ERROR"),
        400..=499 => Some("AI_PROCESSING_FAILED"),
        _ => None,
    }
}

/// Classify an HTTP status alone.
pub fn classify_status(status: u16) -> ErrorClassification {
    code_for_status(status)
        .and_then(lookup)
        .map(from_entry)
        .unwrap_or_else(unknown)
}

/// Classify by error code, falling back to keywords in `message`.
pub fn classify_error(error_type: &str, message: &str) -> ErrorClassification {
    let code = error_type.trim().to_ascii_uppercase();
    if let Some(e) = lookup(&code) {
        return from_entry(e);
    }
    classify_by_keywords(&format!("{} {}", error_type, message))
}

/// Classify a full [`ErrorInfo`]: code first, then status, then keywords.
pub fn classify(info: &ErrorInfo) -> ErrorClassification {
    let code = info.error_type.trim().to_ascii_uppercase();
    if let Some(e) = lookup(&code) {
        return from_entry(e);
    }
    if let Some(status) = info.status {
        if let Some(e) = code_for_status(status).and_then(lookup) {
            return from_entry(e);
        }
    }
    classify_by_keywords(&format!("{} {}", info.error_type, info.message))
}

// Checked in order. Security comes before network so "401 unauthorized" is
// not treated as a transient connection problem, and network and timeout
// come before the generic file rule.
static KEYWORD_RULES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\b(unauthori[sz]ed|forbidden|permission|api[ _-]?key|401|403)\b", "UNAUTHORIZED"),
        (r"\b(rate[ _-]?limit(ed)?|too many requests|429)\b", "RATE_LIMITED"),
        (r"\b(timeout|timed out)\b", "TIMEOUT"),
        (r"\b(network|connection|fetch|dns|socket)\b", "CONNECTION_FAILED"),
        (r"\b(out of memory|heap|memory)\b", "MEMORY_LIMIT_EXCEEDED"),
        (r"\b(json|unexpected token|syntax error)\b", "INVALID_JSON"),
        (r"\b(coordinates?|bounds|validation)\b", "INVALID_COORDINATES"),
        (r"\b(not found|no such file|enoent)\b", "FILE_NOT_FOUND"),
        (r"\b(corrupt(ed)?|file|pdf)\b", "CORRUPTED_FILE"),
        (r"\b(extract(ion)?|process(ing)?|model|ai)\b", "AI_PROCESSING_FAILED"),
    ]
    .into_iter()
    .map(|(pattern, code)| (Regex::new(pattern).expect("valid keyword regex"), code))
    .collect()
});

fn classify_by_keywords(text: &str) -> ErrorClassification {
    let lower = text.to_ascii_lowercase();
    KEYWORD_RULES
        .iter()
        .find(|(re, _)| re.is_match(&lower))
        .and_then(|(_, code)| lookup(code))
        .map(from_entry)
        .unwrap_or_else(unknown)
}

fn unknown() -> ErrorClassification {
    lookup("UNKNOWN_ERROR").map(from_entry).unwrap_or(ErrorClassification {
        code: "UNKNOWN_ERROR".into(),
        category: ErrorCategory::System,
        severity: Severity::Medium,
        recoverable: false,
        user_message: "An unexpected error occurred.".into(),
    })
}
