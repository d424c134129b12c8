//! Input resolution: turn a user-supplied path or URL into document bytes.
//!
//! pdfium loads straight from a byte slice, so URL inputs are downloaded
//! into memory. Both paths validate the PDF magic bytes (`%PDF`) so callers
//! get a meaningful error rather than a pdfium parse failure.

use crate::error::Pdf2TextError;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a path or HTTP(S) URL to the document's bytes.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<Vec<u8>, Pdf2TextError> {
    if input.trim().is_empty() {
        return Err(Pdf2TextError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else if input.contains("://") {
        Err(Pdf2TextError::InvalidInput {
            input: input.to_string(),
        })
    } else {
        read_local(input).await
    }
}

/// Reject bytes that do not start with `%PDF`.
pub fn check_magic(bytes: &[u8]) -> Result<(), Pdf2TextError> {
    if bytes.len() >= 4 && &bytes[..4] == PDF_MAGIC {
        return Ok(());
    }
    let mut magic = [0u8; 4];
    let n = bytes.len().min(4);
    magic[..n].copy_from_slice(&bytes[..n]);
    Err(Pdf2TextError::NotAPdf { magic })
}

async fn read_local(path_str: &str) -> Result<Vec<u8>, Pdf2TextError> {
    let path = PathBuf::from(path_str);
    let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => Pdf2TextError::PermissionDenied { path: path.clone() },
        _ => Pdf2TextError::FileNotFound { path: path.clone() },
    })?;
    check_magic(&bytes)?;
    debug!("Read local PDF: {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes)
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, Pdf2TextError> {
    info!("Downloading PDF from: {}", url);

    let failed = |reason: String| Pdf2TextError::DownloadFailed {
        url: url.to_string(),
        reason,
    };
    let classify = |e: reqwest::Error| {
        if e.is_timeout() {
            Pdf2TextError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(classify)?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(classify)?;
    check_magic(&bytes)?;
    info!("Downloaded {} bytes", bytes.len());
    Ok(bytes.to_vec())
}
