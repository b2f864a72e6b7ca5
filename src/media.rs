//! Media classification
//!
//! Sniffs MIME types from raw bytes, checks image dimensions against the
//! service limit, and carves PDF documents out of mixed input. A PDF starts
//! at `%PDF-` and ends at the last `%%EOF` before the next `%PDF-` (or the end
//! of input), so incremental-update PDFs stay in one piece.

use image::{ImageFormat, ImageReader};
use memchr::memmem;
use std::io::Cursor;

use crate::error::BodsError;
use crate::messages::{IMAGE_MEDIA_TYPES, MEDIA_TYPE_PDF};

/// Bytes inspected when sniffing
const SNIFF_LEN: usize = 512;

/// Largest width or height Bedrock accepts
pub const MAX_IMAGE_DIMENSION: u32 = 8000;

const PDF_MAGIC: &[u8] = b"%PDF-";
const PDF_EOF: &[u8] = b"%%EOF";

pub const MIME_TEXT: &str = "text/plain; charset=utf-8";
pub const MIME_BINARY: &str = "application/octet-stream";

/// Image formats with a magic number strong enough to trust from a sniff
const SNIFFED_IMAGE_FORMATS: &[ImageFormat] = &[
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Gif,
    ImageFormat::WebP,
    ImageFormat::Bmp,
    ImageFormat::Ico,
    ImageFormat::Tiff,
];

// ═══════════════════════════════════════════════════════════════
// SNIFFING
// ═══════════════════════════════════════════════════════════════

/// MIME type from the leading bytes
pub fn detect_mime(bytes: &[u8]) -> &'static str {
    let head = &bytes[..bytes.len().min(SNIFF_LEN)];

    if let Ok(format) = image::guess_format(head) {
        // "BM" is also how plenty of prose starts
        let plausible = format != ImageFormat::Bmp || !looks_like_text(head);
        if SNIFFED_IMAGE_FORMATS.contains(&format) && plausible {
            return format.to_mime_type();
        }
    }
    if head.starts_with(PDF_MAGIC) {
        return MEDIA_TYPE_PDF;
    }
    if looks_like_text(head) {
        MIME_TEXT
    } else {
        MIME_BINARY
    }
}

pub fn is_image_mime(mime: &str) -> bool {
    mime.starts_with("image/")
}

/// Valid UTF-8, allowing a multi-byte character cut off at the sniff boundary
fn looks_like_text(head: &[u8]) -> bool {
    match std::str::from_utf8(head) {
        Ok(s) => !s.contains('\0'),
        Err(e) => e.error_len().is_none() && !head[..e.valid_up_to()].contains(&0),
    }
}

// ═══════════════════════════════════════════════════════════════
// IMAGES
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Decode just enough of an image to learn its size and MIME type
pub fn decode_image(bytes: &[u8]) -> Result<(Dimensions, &'static str), BodsError> {
    let mime = detect_mime(bytes);
    if !IMAGE_MEDIA_TYPES.contains(&mime) {
        return Err(BodsError::InputClassification(format!(
            "unsupported image type: {}. Supported types are: {}",
            mime,
            IMAGE_MEDIA_TYPES.join(", ")
        )));
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| BodsError::InputClassification(format!("failed to read image of type {}: {}", mime, e)))?;
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| BodsError::InputClassification(format!("failed to decode image of type {}: {}", mime, e)))?;

    tracing::debug!("{} x {} size of {} image", width, height, mime);
    Ok((Dimensions { width, height }, mime))
}

pub fn validate_image(dims: Dimensions) -> Result<(), BodsError> {
    if dims.width > MAX_IMAGE_DIMENSION || dims.height > MAX_IMAGE_DIMENSION {
        return Err(BodsError::InputClassification(format!(
            "the maximum height and width of an image is {} pixels. The image has size {} x {}",
            MAX_IMAGE_DIMENSION, dims.width, dims.height
        )));
    }
    Ok(())
}

/// Decode and size-check in one step; returns the MIME type to send
pub fn check_image(bytes: &[u8]) -> Result<&'static str, BodsError> {
    let (dims, mime) = decode_image(bytes)?;
    validate_image(dims)?;
    Ok(mime)
}

// ═══════════════════════════════════════════════════════════════
// PDF
// ═══════════════════════════════════════════════════════════════

/// A stretch of input, either plain bytes or one embedded PDF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a [u8]),
    Pdf(&'a [u8]),
}

/// Split input into text and PDF stretches, in input order.
///
/// A `%PDF-` with no `%%EOF` before the next marker stays part of the
/// surrounding text.
pub fn split_segments(bytes: &[u8]) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut search = 0;

    while let Some(start) = memmem::find(&bytes[search..], PDF_MAGIC).map(|i| i + search) {
        let after = start + PDF_MAGIC.len();
        let limit = memmem::find(&bytes[after..], PDF_MAGIC).map_or(bytes.len(), |i| i + after);

        match memmem::rfind(&bytes[start..limit], PDF_EOF) {
            Some(eof) => {
                let end = start + eof + PDF_EOF.len();
                if start > text_start {
                    segments.push(Segment::Text(&bytes[text_start..start]));
                }
                segments.push(Segment::Pdf(&bytes[start..end]));
                text_start = end;
                search = end;
            }
            None => search = limit,
        }
    }

    if text_start < bytes.len() {
        segments.push(Segment::Text(&bytes[text_start..]));
    }
    segments
}

/// Every embedded PDF, plus the remaining bytes.
///
/// Joining the text stretches can line up a new `%PDF-` … `%%EOF` pair across
/// a boundary, so extraction repeats on the leftover until it holds no PDF.
pub fn extract_pdfs(bytes: &[u8]) -> (Vec<Vec<u8>>, Vec<u8>) {
    let mut pdfs = Vec::new();
    let mut leftover = bytes.to_vec();
    loop {
        let mut text = Vec::with_capacity(leftover.len());
        let mut found = false;
        for segment in split_segments(&leftover) {
            match segment {
                Segment::Pdf(pdf) => {
                    pdfs.push(pdf.to_vec());
                    found = true;
                }
                Segment::Text(stretch) => text.extend_from_slice(stretch),
            }
        }
        leftover = text;
        if !found {
            return (pdfs, leftover);
        }
    }
}

/// Parse the document; a slice that only looks like a PDF is rejected
pub fn validate_pdf(bytes: &[u8]) -> Result<(), BodsError> {
    let invalid = |e: lopdf::Error| BodsError::InputClassification(format!("invalid PDF document: {}", e));
    let document = lopdf::Document::load_mem(bytes).map_err(invalid)?;
    document.catalog().map_err(invalid)?;
    tracing::debug!("PDF {} with {} objects", document.version, document.objects.len());
    Ok(())
}
