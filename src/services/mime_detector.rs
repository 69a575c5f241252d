//! MIME 类型检测
//!
//! Resolution order: declared type, filename extension, magic number, then
//! `application/octet-stream`.

use regex::Regex;
use std::fmt;

use crate::error::{AppError, Result};

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Where the resolved MIME value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeSource {
    Declared,
    Extension,
    MagicNumber,
    Fallback,
}

impl fmt::Display for MimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MimeSource::Declared => "declared",
            MimeSource::Extension => "extension",
            MimeSource::MagicNumber => "magic",
            MimeSource::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

/// Leading-byte signatures. Offset-based formats are handled in `sniff`.
const MAGIC_NUMBERS: &[(&[u8], &str)] = &[
    // 文档
    (b"%PDF-", "application/pdf"),
    (b"SQLite format 3\0", "application/vnd.sqlite3"),
    // 图片
    (&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A], "image/png"),
    (&[0xFF, 0xD8, 0xFF], "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (&[0x49, 0x49, 0x2A, 0x00], "image/tiff"),
    (&[0x4D, 0x4D, 0x00, 0x2A], "image/tiff"),
    (b"BM", "image/bmp"),
    // 视频/音频
    (&[0x1A, 0x45, 0xDF, 0xA3], "video/x-matroska"),
    (b"ID3", "audio/mpeg"),
    (&[0xFF, 0xFB], "audio/mpeg"),
    (&[0xFF, 0xF3], "audio/mpeg"),
    (b"OggS", "audio/ogg"),
    (b"fLaC", "audio/flac"),
    // 压缩文件
    (&[0x50, 0x4B, 0x03, 0x04], "application/zip"),
    (&[0x50, 0x4B, 0x05, 0x06], "application/zip"),
    (&[0x1F, 0x8B], "application/gzip"),
    (&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C], "application/x-7z-compressed"),
    (b"Rar!\x1A\x07", "application/x-rar-compressed"),
    (b"BZh", "application/x-bzip2"),
    (&[0x28, 0xB5, 0x2F, 0xFD], "application/zstd"),
];

/// Identify content by its leading bytes.
pub fn sniff(content: &[u8]) -> Option<&'static str> {
    // RIFF containers carry their real type at offset 8
    if content.len() >= 12 && content.starts_with(b"RIFF") {
        return match &content[8..12] {
            b"WEBP" => Some("image/webp"),
            b"WAVE" => Some("audio/wav"),
            b"AVI " => Some("video/x-msvideo"),
            _ => None,
        };
    }

    // ISO base media: box size, then `ftyp`
    if content.len() >= 12 && &content[4..8] == b"ftyp" {
        return match &content[8..12] {
            b"M4A " => Some("audio/mp4"),
            b"qt  " => Some("video/quicktime"),
            b"heic" | b"heix" => Some("image/heic"),
            _ => Some("video/mp4"),
        };
    }

    MAGIC_NUMBERS
        .iter()
        .find(|(magic, _)| content.starts_with(magic))
        .map(|&(_, mime)| mime)
}

/// Lookup by extension. Unknown extensions give `None`.
pub fn from_extension(filename: &str) -> Option<String> {
    mime_guess::from_path(filename)
        .first()
        .map(|mime| mime.essence_str().to_string())
}

/// Resolve a MIME value following the declared → extension → magic →
/// fallback precedence. A declared `application/octet-stream` says nothing and
/// is skipped.
pub fn resolve(
    content: &[u8],
    declared_filename: Option<&str>,
    declared_mime: Option<&str>,
) -> (String, MimeSource) {
    if let Some(declared) = declared_mime.map(normalize).filter(|m| is_informative(m)) {
        return (declared, MimeSource::Declared);
    }

    if let Some(mime) = declared_filename.and_then(from_extension) {
        return (mime, MimeSource::Extension);
    }

    if let Some(mime) = sniff(content) {
        return (mime.to_string(), MimeSource::MagicNumber);
    }

    (OCTET_STREAM.to_string(), MimeSource::Fallback)
}

/// Lowercase essence without parameters.
fn normalize(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_informative(mime: &str) -> bool {
    !mime.is_empty() && mime != OCTET_STREAM && mime.contains('/')
}

/// Glob allow-list over MIME values (`image/*`, `application/pdf`).
/// An empty list accepts everything.
#[derive(Debug, Clone, Default)]
pub struct MimeAllowList {
    patterns: Vec<(String, Regex)>,
}

impl MimeAllowList {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                glob_to_regex(pattern)
                    .map(|re| (pattern.clone(), re))
                    .map_err(|e| {
                        AppError::Config(format!("Invalid MIME pattern '{}': {}", pattern, e))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn allows(&self, mime: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let mime = normalize(mime);
        self.patterns.iter().any(|(_, re)| re.is_match(&mime))
    }

    pub fn check(&self, mime: &str) -> Result<()> {
        if self.allows(mime) {
            Ok(())
        } else {
            Err(AppError::UnsupportedType(format!(
                "{} is not in the allowed MIME types",
                mime
            )))
        }
    }
}

/// 简单的 glob 模式匹配（支持 * 和 ?），整串匹配且不区分大小写
fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut regex_pattern = String::from("^");
    for c in pattern.trim().to_lowercase().chars() {
        match c {
            '*' => regex_pattern.push_str(".*"),
            '?' => regex_pattern.push('.'),
            other => regex_pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex_pattern.push('$');
    Regex::new(&regex_pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"%PDF-1.7\n".as_slice(), Some("application/pdf"))]
    #[case(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0], Some("image/png"))]
    #[case(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10], Some("image/jpeg"))]
    #[case(b"GIF89a....".as_slice(), Some("image/gif"))]
    #[case(b"RIFF\x24\x00\x00\x00WEBPVP8 ".as_slice(), Some("image/webp"))]
    #[case(b"RIFF\x24\x00\x00\x00WAVEfmt ".as_slice(), Some("audio/wav"))]
    #[case(b"\x00\x00\x00\x18ftypmp42".as_slice(), Some("video/mp4"))]
    #[case(&[0x50, 0x4B, 0x03, 0x04, 0x14, 0x00], Some("application/zip"))]
    #[case(b"SQLite format 3\0rest".as_slice(), Some("application/vnd.sqlite3"))]
    #[case(b"ID3\x03\x00".as_slice(), Some("audio/mpeg"))]
    #[case(b"plain text".as_slice(), None)]
    #[case(b"".as_slice(), None)]
    fn test_sniff(#[case] content: &[u8], #[case] expected: Option<&str>) {
        assert_eq!(sniff(content), expected);
    }

    #[test]
    fn test_declared_type_wins() {
        let (mime, source) = resolve(b"%PDF-1.4", Some("a.txt"), Some("Image/PNG; q=1"));
        assert_eq!(mime, "image/png");
        assert_eq!(source, MimeSource::Declared);
    }

    #[test]
    fn test_octet_stream_declaration_is_ignored() {
        let (mime, source) = resolve(b"%PDF-1.4", None, Some("application/octet-stream"));
        assert_eq!(mime, "application/pdf");
        assert_eq!(source, MimeSource::MagicNumber);
    }

    #[test]
    fn test_extension_before_magic() {
        let (mime, source) = resolve(b"%PDF-1.4", Some("notes.txt"), None);
        assert_eq!(mime, "text/plain");
        assert_eq!(source, MimeSource::Extension);
    }

    #[test]
    fn test_unknown_everything_falls_back() {
        let (mime, source) = resolve(b"\x01\x02\x03", Some("blob.unknownext"), Some(""));
        assert_eq!(mime, OCTET_STREAM);
        assert_eq!(source, MimeSource::Fallback);
    }

    #[test]
    fn test_allow_list() {
        let list = MimeAllowList::new(&["image/*".to_string(), "application/pdf".to_string()])
            .unwrap();
        assert!(list.allows("image/jpeg"));
        assert!(list.allows("IMAGE/PNG"));
        assert!(list.allows("application/pdf"));
        assert!(!list.allows("application/pdfx"));
        assert!(!list.allows("text/plain"));
        assert!(matches!(
            list.check("text/plain"),
            Err(AppError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_empty_allow_list_accepts_all() {
        let list = MimeAllowList::new(&[]).unwrap();
        assert!(list.is_empty());
        assert!(list.allows("application/x-anything"));
    }
}
