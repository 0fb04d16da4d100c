//! Staging of caller-supplied reference audio in the scratch directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jobs::remove_staged_file;

const DEFAULT_EXTENSION: &str = "mp3";
const MAX_EXTENSION_LEN: usize = 5;

/// Writes `bytes` to `<scratch>/upload-<uuid>/uploaded_audio_<hex>.<ext>` and
/// returns the file path.
pub(crate) async fn stage_reference_audio(
    scratch_dir: &Path,
    bytes: &[u8],
    extension: &str,
) -> Result<PathBuf> {
    let token = Uuid::new_v4().simple().to_string();
    let dir = scratch_dir.join(format!("upload-{token}"));
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create staging directory: {}", dir.display()))?;

    let path = dir.join(format!(
        "uploaded_audio_{}.{}",
        &token[..8],
        sanitize_extension(extension)
    ));
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("failed to stage reference audio: {}", path.display()))?;

    debug!(path = %path.display(), size_bytes = bytes.len(), "Staged reference audio");
    Ok(path)
}

/// Drops a staged file whose job was never admitted.
pub(crate) fn discard_staged(scratch_dir: &Path, path: &Path) {
    if let Err(e) = remove_staged_file(scratch_dir, path) {
        warn!(path = %path.display(), error = %format!("{e:#}"), "Failed to discard staged audio");
    }
}

/// Accepts raw base64 or a `data:audio/...;base64,` URL.
pub(crate) fn decode_base64_audio(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    let payload = match trimmed.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => trimmed,
    };
    let bytes = STANDARD
        .decode(payload)
        .context("audio_base64 is not valid base64")?;
    anyhow::ensure!(!bytes.is_empty(), "audio_base64 decoded to zero bytes");
    Ok(bytes)
}

/// Picks a file extension from the upload's content type, falling back to
/// the original file name.
pub(crate) fn extension_for_upload(content_type: &str, file_name: Option<&str>) -> String {
    let from_mime = match content_type.split(';').next().map(str::trim) {
        Some("audio/mpeg") | Some("audio/mp3") => Some("mp3"),
        Some("audio/wav") | Some("audio/x-wav") | Some("audio/wave") => Some("wav"),
        Some("audio/flac") | Some("audio/x-flac") => Some("flac"),
        Some("audio/ogg") => Some("ogg"),
        _ => None,
    };
    if let Some(ext) = from_mime {
        return ext.to_string();
    }

    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(sanitize_extension)
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

fn sanitize_extension(raw: &str) -> String {
    let cleaned: String = raw
        .trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(MAX_EXTENSION_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    if cleaned.is_empty() {
        DEFAULT_EXTENSION.to_string()
    } else {
        cleaned
    }
}
