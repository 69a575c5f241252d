//! 按内容分类提取元数据
//!
//! Each extractor is independent. A category without an extractor, or an
//! extractor that fails, contributes an empty map; extraction never fails a
//! store.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::io::Cursor;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::models::ContentCategory;

pub type MetadataMap = Map<String, Value>;

/// Per-category metadata extraction.
pub trait MetadataExtractor: Send + Sync {
    fn category(&self) -> ContentCategory;

    fn extract(&self, content: &[u8], mime: &str) -> Result<MetadataMap>;
}

/// Extractors keyed by category.
pub struct ExtractorRegistry {
    extractors: HashMap<ContentCategory, Box<dyn MetadataExtractor>>,
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// Image, text, document and archive extractors.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(ImageExtractor));
        registry.register(Box::new(TextExtractor));
        registry.register(Box::new(DocumentExtractor));
        registry.register(Box::new(ArchiveExtractor));
        registry
    }

    /// Replaces any extractor already registered for the same category.
    pub fn register(&mut self, extractor: Box<dyn MetadataExtractor>) {
        self.extractors.insert(extractor.category(), extractor);
    }

    pub fn extract(&self, category: ContentCategory, content: &[u8], mime: &str) -> MetadataMap {
        let Some(extractor) = self.extractors.get(&category) else {
            return MetadataMap::new();
        };
        match extractor.extract(content, mime) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(category = %category, mime = %mime, error = %e, "Metadata extraction failed");
                MetadataMap::new()
            }
        }
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("categories", &self.extractors.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn extraction_error(message: impl Into<String>) -> AppError {
    AppError::ExtractionFailed(message.into())
}

fn be_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn le_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn be_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn le_i32(bytes: &[u8], at: usize) -> Option<i32> {
    bytes
        .get(at..at + 4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// 图片：格式与尺寸
pub struct ImageExtractor;

impl ImageExtractor {
    fn dimensions(content: &[u8]) -> Option<(&'static str, u64, u64)> {
        if content.starts_with(&[0x89, b'P', b'N', b'G']) {
            if content.get(12..16) != Some(b"IHDR".as_slice()) {
                return None;
            }
            return Some((
                "png",
                be_u32(content, 16)? as u64,
                be_u32(content, 20)? as u64,
            ));
        }
        if content.starts_with(b"GIF8") {
            return Some((
                "gif",
                le_u16(content, 6)? as u64,
                le_u16(content, 8)? as u64,
            ));
        }
        if content.starts_with(b"BM") {
            return Some((
                "bmp",
                le_i32(content, 18)?.unsigned_abs() as u64,
                le_i32(content, 22)?.unsigned_abs() as u64,
            ));
        }
        if content.starts_with(&[0xFF, 0xD8]) {
            return Self::jpeg_dimensions(content).map(|(w, h)| ("jpeg", w, h));
        }
        None
    }

    /// Walk the marker segments up to the first start-of-frame.
    fn jpeg_dimensions(content: &[u8]) -> Option<(u64, u64)> {
        let mut pos = 2;
        while pos + 4 <= content.len() {
            if content[pos] != 0xFF {
                return None;
            }
            let marker = content[pos + 1];
            match marker {
                0xFF => {
                    pos += 1;
                    continue;
                }
                0x01 | 0xD0..=0xD7 => {
                    pos += 2;
                    continue;
                }
                0xD9 | 0xDA => return None,
                _ => {}
            }
            let length = be_u16(content, pos + 2)? as usize;
            let is_frame = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
            if is_frame {
                let height = be_u16(content, pos + 5)? as u64;
                let width = be_u16(content, pos + 7)? as u64;
                return Some((width, height));
            }
            pos += 2 + length;
        }
        None
    }
}

impl MetadataExtractor for ImageExtractor {
    fn category(&self) -> ContentCategory {
        ContentCategory::Image
    }

    fn extract(&self, content: &[u8], mime: &str) -> Result<MetadataMap> {
        let mut metadata = MetadataMap::new();
        match Self::dimensions(content) {
            Some((format, width, height)) => {
                metadata.insert("format".to_string(), json!(format));
                metadata.insert("width".to_string(), json!(width));
                metadata.insert("height".to_string(), json!(height));
            }
            None => {
                debug!(mime = %mime, "No dimensions for image");
                if let Some((_, sub)) = mime.split_once('/') {
                    metadata.insert("format".to_string(), json!(sub));
                }
            }
        }
        Ok(metadata)
    }
}

/// 文本：编码与行/词/字符统计
pub struct TextExtractor;

impl TextExtractor {
    fn decode(content: &[u8]) -> (String, &'static str, bool) {
        if let Some((encoding, bom_len)) = encoding_rs::Encoding::for_bom(content) {
            let (text, had_errors) = encoding.decode_without_bom_handling(&content[bom_len..]);
            return (text.into_owned(), encoding.name(), had_errors);
        }

        // UTF-8 快速路径
        if let Ok(text) = std::str::from_utf8(content) {
            return (text.to_string(), encoding_rs::UTF_8.name(), false);
        }

        let mut detector = chardetng::EncodingDetector::new();
        detector.feed(content, true);
        let encoding = detector.guess(None, true);
        let (text, had_errors) = encoding.decode_without_bom_handling(content);
        (text.into_owned(), encoding.name(), had_errors)
    }
}

impl MetadataExtractor for TextExtractor {
    fn category(&self) -> ContentCategory {
        ContentCategory::Text
    }

    fn extract(&self, content: &[u8], _mime: &str) -> Result<MetadataMap> {
        let (text, encoding, had_errors) = Self::decode(content);
        let mut metadata = MetadataMap::new();
        metadata.insert("encoding".to_string(), json!(encoding));
        metadata.insert("line_count".to_string(), json!(text.lines().count()));
        metadata.insert(
            "word_count".to_string(),
            json!(text.split_whitespace().count()),
        );
        metadata.insert("char_count".to_string(), json!(text.chars().count()));
        if had_errors {
            metadata.insert("had_decode_errors".to_string(), json!(true));
        }
        Ok(metadata)
    }
}

static PDF_PAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/Type\s*/Page(?-u:[^s]|$)").expect("valid page pattern"));

/// 文档：PDF 版本与页数估计
pub struct DocumentExtractor;

impl MetadataExtractor for DocumentExtractor {
    fn category(&self) -> ContentCategory {
        ContentCategory::Document
    }

    fn extract(&self, content: &[u8], mime: &str) -> Result<MetadataMap> {
        let mut metadata = MetadataMap::new();
        if !content.starts_with(b"%PDF-") {
            // Office formats need a parser this crate does not carry
            debug!(mime = %mime, "No extractor for document format");
            return Ok(metadata);
        }

        let version: String = content[5..]
            .iter()
            .take_while(|b| b.is_ascii_digit() || **b == b'.')
            .map(|&b| b as char)
            .collect();
        if version.is_empty() {
            return Err(extraction_error("PDF header carries no version"));
        }

        metadata.insert("format".to_string(), json!("pdf"));
        metadata.insert("pdf_version".to_string(), json!(version));
        metadata.insert(
            "page_count".to_string(),
            json!(PDF_PAGE.find_iter(content).count()),
        );
        Ok(metadata)
    }
}

/// 压缩文件：条目数与解压后总大小
pub struct ArchiveExtractor;

impl ArchiveExtractor {
    fn zip_summary(content: &[u8]) -> Result<MetadataMap> {
        let mut archive = zip::ZipArchive::new(Cursor::new(content))
            .map_err(|e| extraction_error(format!("Unreadable ZIP archive: {}", e)))?;

        let mut sizes = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive
                .by_index_raw(index)
                .map_err(|e| extraction_error(format!("Unreadable ZIP entry {}: {}", index, e)))?;
            sizes.push(entry.size());
        }
        let uncompressed = total_size(sizes);

        let mut metadata = MetadataMap::new();
        metadata.insert("format".to_string(), json!("zip"));
        metadata.insert("entry_count".to_string(), json!(archive.len()));
        metadata.insert("uncompressed_size".to_string(), json!(uncompressed));
        Ok(metadata)
    }
}

/// Declared entry sizes are untrusted; the total clamps at `u64::MAX`.
fn total_size(sizes: impl IntoIterator<Item = u64>) -> u64 {
    sizes.into_iter().fold(0u64, u64::saturating_add)
}

impl MetadataExtractor for ArchiveExtractor {
    fn category(&self) -> ContentCategory {
        ContentCategory::Archive
    }

    fn extract(&self, content: &[u8], mime: &str) -> Result<MetadataMap> {
        if content.starts_with(b"PK") {
            return Self::zip_summary(content);
        }

        let mut metadata = MetadataMap::new();
        if content.starts_with(&[0x1F, 0x8B]) && content.len() >= 18 {
            // gzip trailer: ISIZE, input size modulo 2^32
            let tail = &content[content.len() - 4..];
            let size = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
            metadata.insert("format".to_string(), json!("gzip"));
            metadata.insert("uncompressed_size".to_string(), json!(size));
        } else {
            debug!(mime = %mime, "No extractor for archive format");
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        png.extend_from_slice(&13u32.to_be_bytes());
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&width.to_be_bytes());
        png.extend_from_slice(&height.to_be_bytes());
        png.extend_from_slice(&[8, 2, 0, 0, 0]);
        png
    }

    #[test]
    fn test_png_dimensions() {
        let metadata = ImageExtractor.extract(&png_header(640, 480), "image/png").unwrap();
        assert_eq!(metadata["format"], json!("png"));
        assert_eq!(metadata["width"], json!(640));
        assert_eq!(metadata["height"], json!(480));
    }

    #[test]
    fn test_jpeg_dimensions_skip_app_segments() {
        let mut jpeg = vec![0xFF, 0xD8];
        // APP0 with 14 bytes of payload
        jpeg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        jpeg.extend_from_slice(&[0u8; 14]);
        // SOF0: length, precision, height 200, width 300
        jpeg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08, 0x00, 0xC8, 0x01, 0x2C]);
        jpeg.extend_from_slice(&[0u8; 10]);

        let metadata = ImageExtractor.extract(&jpeg, "image/jpeg").unwrap();
        assert_eq!(metadata["width"], json!(300));
        assert_eq!(metadata["height"], json!(200));
    }

    #[test]
    fn test_gif_dimensions() {
        let gif = b"GIF89a\x20\x00\x10\x00rest";
        let metadata = ImageExtractor.extract(gif, "image/gif").unwrap();
        assert_eq!(metadata["width"], json!(32));
        assert_eq!(metadata["height"], json!(16));
    }

    #[test]
    fn test_text_counts() {
        let metadata = TextExtractor
            .extract("hello world\nsecond line\n".as_bytes(), "text/plain")
            .unwrap();
        assert_eq!(metadata["encoding"], json!("UTF-8"));
        assert_eq!(metadata["line_count"], json!(2));
        assert_eq!(metadata["word_count"], json!(4));
        assert_eq!(metadata["char_count"], json!(24));
    }

    #[test]
    fn test_text_non_utf8_is_detected() {
        // "café" in windows-1252
        let metadata = TextExtractor.extract(b"caf\xe9 au lait", "text/plain").unwrap();
        assert_ne!(metadata["encoding"], json!("UTF-8"));
        assert_eq!(metadata["word_count"], json!(3));
    }

    #[test]
    fn test_pdf_version_and_pages() {
        let pdf = b"%PDF-1.7\n1 0 obj << /Type /Pages /Count 2 >>\n\
                    2 0 obj << /Type /Page >>\n3 0 obj << /Type/Page >>\n%%EOF";
        let metadata = DocumentExtractor.extract(pdf, "application/pdf").unwrap();
        assert_eq!(metadata["pdf_version"], json!("1.7"));
        assert_eq!(metadata["page_count"], json!(2));
    }

    #[test]
    fn test_zip_summary() {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("a.txt", options).unwrap();
            writer.write_all(b"hello").unwrap();
            writer.start_file("b.txt", options).unwrap();
            writer.write_all(b"world!").unwrap();
            writer.finish().unwrap();
        }

        let metadata = ArchiveExtractor
            .extract(buffer.get_ref(), "application/zip")
            .unwrap();
        assert_eq!(metadata["entry_count"], json!(2));
        assert_eq!(metadata["uncompressed_size"], json!(11));
    }

    #[test]
    fn test_declared_sizes_saturate() {
        assert_eq!(total_size([5, 6]), 11);
        assert_eq!(total_size([u64::MAX - 1, u64::MAX - 1, 3]), u64::MAX);
        assert_eq!(total_size(std::iter::empty()), 0);
    }

    #[test]
    fn test_registry_swallows_failures() {
        let registry = ExtractorRegistry::with_defaults();
        let metadata = registry.extract(ContentCategory::Archive, b"PK not a zip", "application/zip");
        assert!(metadata.is_empty());

        let metadata = registry.extract(ContentCategory::Audio, b"ID3", "audio/mpeg");
        assert!(metadata.is_empty());
    }
}
