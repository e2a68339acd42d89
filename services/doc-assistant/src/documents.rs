//! PDF text extraction
//!
//! Wraps the `pdf-extract` crate. Parsing runs on the blocking pool because
//! it is CPU-bound and the parser may panic on malformed input; a panic is
//! reported as an extraction failure for that file, not a crashed worker.

use thiserror::Error;
use tracing::{debug, info};

/// An uploaded document: original file name plus raw bytes.
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("could not read {name}: {reason}")]
    Unreadable { name: String, reason: String },

    #[error("no documents supplied")]
    NoDocuments,
}

/// Turns one file's bytes into text.
pub type Extractor = fn(&[u8]) -> Result<String, String>;

/// `Extractor` backed by `pdf-extract`.
pub fn pdf_text(bytes: &[u8]) -> Result<String, String> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| e.to_string())
}

/// Extract and concatenate the text of every document, in upload order.
///
/// Documents that contain no text (e.g. scanned images) contribute nothing.
pub async fn extract_text(
    documents: Vec<Document>,
    extract: Extractor,
) -> Result<String, ExtractError> {
    if documents.is_empty() {
        return Err(ExtractError::NoDocuments);
    }

    let mut text = String::new();
    for doc in documents {
        let name = doc.name.clone();
        let page_text = tokio::task::spawn_blocking(move || extract(&doc.bytes))
            .await
            .map_err(|e| ExtractError::Unreadable {
                name: name.clone(),
                reason: if e.is_panic() {
                    "parser panicked on malformed PDF".into()
                } else {
                    e.to_string()
                },
            })?
            .map_err(|reason| ExtractError::Unreadable {
                name: name.clone(),
                reason,
            })?;

        debug!(document = %name, chars = page_text.chars().count(), "extracted document");
        text.push_str(&page_text);
    }

    info!(chars = text.chars().count(), "text extraction complete");
    Ok(text)
}
