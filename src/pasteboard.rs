//! Clipboard input (`-P`)
//!
//! The clipboard holds either a bitmap, which is re-encoded as PNG, or text.
//! Text made only of `file://` URLs (what Finder puts there when files are
//! copied) is replaced by the files themselves.

use image::{ImageFormat, RgbaImage};
use reqwest::Url;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use crate::content::{classify_payload, no_vision};
use crate::error::BodsError;
use crate::media;
use crate::messages::{ContentBlock, MEDIA_TYPE_PNG};
use crate::models::ModelId;

/// Pasted files larger than this are skipped
const MAX_PASTED_FILE: u64 = 1024 * 1024 * 32;

const NO_IMAGE: &str =
    "there was a problem reading the image from the clipboard. Did you copy an image to the clipboard?";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clip {
    /// Raw RGBA pixels, row major
    Image { width: u32, height: u32, rgba: Vec<u8> },
    Text(String),
    Empty,
}

/// Content blocks for whatever is on the clipboard right now
pub fn read_blocks(model: &ModelId) -> Result<Vec<ContentBlock>, BodsError> {
    clip_blocks(model, read_clip()?)
}

pub fn clip_blocks(model: &ModelId, clip: Clip) -> Result<Vec<ContentBlock>, BodsError> {
    match clip {
        Clip::Image { width, height, rgba } => {
            if !model.supports_vision() {
                return Err(no_vision(model));
            }
            let png = encode_png(width, height, rgba)?;
            let mime = media::check_image(&png)?;
            Ok(vec![ContentBlock::image(mime, &png)])
        }
        Clip::Text(text) => match file_urls(&text) {
            Some(paths) => file_blocks(model, &paths),
            None => classify_payload(model, text.as_bytes()),
        },
        Clip::Empty => {
            tracing::warn!("clipboard is empty");
            Ok(Vec::new())
        }
    }
}

pub fn encode_png(width: u32, height: u32, rgba: Vec<u8>) -> Result<Vec<u8>, BodsError> {
    let pixels = RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| BodsError::InputClassification(NO_IMAGE.to_string()))?;
    let mut png = Cursor::new(Vec::new());
    pixels
        .write_to(&mut png, ImageFormat::Png)
        .map_err(|e| BodsError::InputClassification(format!("{} {}", NO_IMAGE, e)))?;
    tracing::debug!("clipboard image {} x {} encoded as {}", width, height, MEDIA_TYPE_PNG);
    Ok(png.into_inner())
}

/// Every non-comment line is a `file://` URL, or `None`
fn file_urls(text: &str) -> Option<Vec<std::path::PathBuf>> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    if lines.is_empty() || !lines.iter().all(|l| l.starts_with("file://")) {
        return None;
    }
    lines
        .into_iter()
        .map(|l| Url::parse(l).ok().and_then(|u| u.to_file_path().ok()))
        .collect()
}

fn file_blocks(model: &ModelId, paths: &[std::path::PathBuf]) -> Result<Vec<ContentBlock>, BodsError> {
    let mut blocks = Vec::new();
    for path in paths {
        match read_pasted_file(path) {
            Ok(bytes) => blocks.extend(classify_file(model, path, &bytes)?),
            Err(e) => tracing::warn!("skipping pasted file {}: {}", path.display(), e),
        }
    }
    Ok(blocks)
}

fn read_pasted_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let len = fs::metadata(path)?.len();
    if len > MAX_PASTED_FILE {
        return Err(std::io::Error::other(format!("file too large: {} bytes", len)));
    }
    fs::read(path)
}

/// Text files are labelled with their name so several can be told apart
fn classify_file(model: &ModelId, path: &Path, bytes: &[u8]) -> Result<Vec<ContentBlock>, BodsError> {
    if media::detect_mime(bytes) != media::MIME_TEXT {
        return classify_payload(model, bytes);
    }
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    let text = String::from_utf8_lossy(bytes);
    Ok(vec![ContentBlock::text(format!("Content from file {}:\n\n{}", name, text))])
}

// ═══════════════════════════════════════════════════════════════
// PLATFORM
// ═══════════════════════════════════════════════════════════════

#[cfg(target_os = "macos")]
fn read_clip() -> Result<Clip, BodsError> {
    let mut clipboard =
        arboard::Clipboard::new().map_err(|e| BodsError::InputClassification(format!("{} {}", NO_IMAGE, e)))?;
    if let Ok(image) = clipboard.get_image() {
        return Ok(Clip::Image {
            width: image.width as u32,
            height: image.height as u32,
            rgba: image.bytes.into_owned(),
        });
    }
    match clipboard.get_text() {
        Ok(text) if !text.trim().is_empty() => Ok(Clip::Text(text)),
        _ => Ok(Clip::Empty),
    }
}

#[cfg(not(target_os = "macos"))]
fn read_clip() -> Result<Clip, BodsError> {
    Err(BodsError::InputClassification(
        "reading the clipboard is only supported on macOS".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::tests::tiny_pdf;
    use crate::models::{CLAUDE_V2, CLAUDE_V37_SONNET};
    use tempfile::TempDir;

    fn red_square() -> Clip {
        Clip::Image {
            width: 2,
            height: 2,
            rgba: [255, 0, 0, 255].repeat(4),
        }
    }

    #[test]
    fn test_image_becomes_png_block() {
        let blocks = clip_blocks(&ModelId::new(CLAUDE_V37_SONNET), red_square()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(matches!(&blocks[0], ContentBlock::Image { source, .. } if source.media_type == MEDIA_TYPE_PNG));
    }

    #[test]
    fn test_image_on_text_only_model_fails() {
        let err = clip_blocks(&ModelId::new(CLAUDE_V2), red_square()).unwrap_err();
        assert!(matches!(err, BodsError::InputClassification(_)));
        assert!(err.to_string().contains("vision"));
    }

    #[test]
    fn test_short_pixel_buffer_is_rejected() {
        assert!(encode_png(4, 4, vec![0; 8]).is_err());
    }

    #[test]
    fn test_text_is_trimmed() {
        let blocks = clip_blocks(&ModelId::new(CLAUDE_V2), Clip::Text("  hello \n".to_string())).unwrap();
        assert_eq!(blocks[0].as_text(), Some("hello"));
    }

    #[test]
    fn test_file_urls_are_read() {
        let dir = TempDir::new().unwrap();
        let notes = dir.path().join("notes.txt");
        let doc = dir.path().join("doc.pdf");
        fs::write(&notes, "meeting at noon").unwrap();
        fs::write(&doc, tiny_pdf("doc")).unwrap();
        let text = format!(
            "file://{}\n# comment\nfile://{}\n",
            notes.display(),
            doc.display()
        );

        let blocks = clip_blocks(&ModelId::new(CLAUDE_V37_SONNET), Clip::Text(text)).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].as_text(), Some("Content from file notes.txt:\n\nmeeting at noon"));
        assert!(matches!(blocks[1], ContentBlock::Document { .. }));
    }

    #[test]
    fn test_mixed_text_is_not_treated_as_urls() {
        assert!(file_urls("see file:///tmp/a.txt").is_none());
        assert!(file_urls("file:///tmp/a.txt\nplain").is_none());
    }

    #[test]
    fn test_empty_clipboard_adds_nothing() {
        assert!(clip_blocks(&ModelId::new(CLAUDE_V2), Clip::Empty).unwrap().is_empty());
    }
}
