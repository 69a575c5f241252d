//! 嵌入附件切割
//!
//! Locates JPEG, PNG and PDF payloads inside an opaque container by their
//! start signature and walks each format's structure to its terminator.
//! Walking segment and chunk lengths (rather than searching for the first end
//! marker) keeps stray `FF D9` or `IEND` bytes inside a payload from ending
//! it early. A signature with no reachable terminator is skipped and the scan
//! resumes one byte later.

use bytes::Bytes;
use tracing::debug;

use crate::models::ExtractedAttachment;

const JPEG_SOI: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_SIGNATURE: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const PDF_HEADER: &[u8] = b"%PDF-";
const PDF_EOF: &[u8] = b"%%EOF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddedKind {
    Jpeg,
    Png,
    Pdf,
}

impl EmbeddedKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            EmbeddedKind::Jpeg => "image/jpeg",
            EmbeddedKind::Png => "image/png",
            EmbeddedKind::Pdf => "application/pdf",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            EmbeddedKind::Jpeg => "jpg",
            EmbeddedKind::Png => "png",
            EmbeddedKind::Pdf => "pdf",
        }
    }

    fn at(container: &[u8], pos: usize) -> Option<Self> {
        let rest = &container[pos..];
        if rest.starts_with(JPEG_SOI) {
            Some(EmbeddedKind::Jpeg)
        } else if rest.starts_with(PNG_SIGNATURE) {
            Some(EmbeddedKind::Png)
        } else if rest.starts_with(PDF_HEADER) {
            Some(EmbeddedKind::Pdf)
        } else {
            None
        }
    }

    fn end(&self, container: &[u8], start: usize, pdf: &mut PdfMarkers) -> Option<usize> {
        match self {
            EmbeddedKind::Jpeg => jpeg_end(container, start),
            EmbeddedKind::Png => png_end(container, start),
            EmbeddedKind::Pdf => pdf_end(container, start, pdf),
        }
    }
}

/// Byte range `[start, end)` of one carved payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarvedRange {
    pub kind: EmbeddedKind,
    pub start: usize,
    pub end: usize,
}

/// Find every complete embedded payload, in container order.
pub fn find_embedded(container: &[u8]) -> Vec<CarvedRange> {
    let mut ranges = Vec::new();
    let mut pdf = PdfMarkers::new();
    let mut pos = 0;

    while pos < container.len() {
        let Some(kind) = EmbeddedKind::at(container, pos) else {
            pos += 1;
            continue;
        };
        match kind.end(container, pos, &mut pdf) {
            Some(end) => {
                ranges.push(CarvedRange {
                    kind,
                    start: pos,
                    end,
                });
                pos = end;
            }
            None => {
                debug!(kind = ?kind, offset = pos, "Signature without terminator, skipping");
                pos += 1;
            }
        }
    }

    ranges
}

/// Carve payloads out of `container` as attachments named `embedded_<n>.<ext>`.
pub fn carve(container: &Bytes, parent_id: &str) -> Vec<ExtractedAttachment> {
    find_embedded(container)
        .into_iter()
        .enumerate()
        .map(|(index, range)| {
            ExtractedAttachment::new(
                format!("embedded_{}.{}", index + 1, range.kind.extension()),
                Some(range.kind.mime_type().to_string()),
                container.slice(range.start..range.end),
                format!("{}:{}-{}", parent_id, range.start, range.end),
            )
        })
        .collect()
}

fn be_u16(data: &[u8], at: usize) -> Option<usize> {
    data.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
}

fn be_u32(data: &[u8], at: usize) -> Option<usize> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
}

/// Walk marker segments from SOI to EOI. Entropy-coded data after SOS is
/// scanned for the next real marker, skipping stuffed `FF 00` and restart
/// markers.
fn jpeg_end(data: &[u8], start: usize) -> Option<usize> {
    let mut pos = start + 2;
    loop {
        if *data.get(pos)? != 0xFF {
            return None;
        }
        let marker = *data.get(pos + 1)?;
        match marker {
            0xFF => pos += 1,
            0xD9 => return Some(pos + 2),
            0xD8 => return None,
            0x01 | 0xD0..=0xD7 => pos += 2,
            0xDA => {
                let length = be_u16(data, pos + 2)?;
                if length < 2 {
                    return None;
                }
                pos += 2 + length;
                pos = skip_entropy_data(data, pos)?;
            }
            _ => {
                let length = be_u16(data, pos + 2)?;
                if length < 2 {
                    return None;
                }
                pos += 2 + length;
            }
        }
    }
}

fn skip_entropy_data(data: &[u8], mut pos: usize) -> Option<usize> {
    while pos + 1 < data.len() {
        if data[pos] != 0xFF {
            pos += 1;
            continue;
        }
        match data[pos + 1] {
            0x00 | 0xD0..=0xD7 => pos += 2,
            0xFF => pos += 1,
            _ => return Some(pos),
        }
    }
    None
}

/// Walk chunks (length, type, data, CRC) up to and including `IEND`.
fn png_end(data: &[u8], start: usize) -> Option<usize> {
    let mut pos = start + PNG_SIGNATURE.len();
    loop {
        let length = be_u32(data, pos)?;
        let chunk_type = data.get(pos + 4..pos + 8)?;
        if !chunk_type.iter().all(u8::is_ascii_alphabetic) {
            return None;
        }
        let next = pos.checked_add(12)?.checked_add(length)?;
        if next > data.len() {
            return None;
        }
        if chunk_type == b"IEND" {
            return Some(next);
        }
        pos = next;
    }
}

/// Cached position of the next occurrence of `needle`.
///
/// Lookups must never move backwards. Each byte is then searched about once
/// per needle, however many bare signatures the container holds.
struct NextMatch {
    needle: &'static [u8],
    found: Option<usize>,
    exhausted: bool,
}

impl NextMatch {
    fn new(needle: &'static [u8]) -> Self {
        Self {
            needle,
            found: None,
            exhausted: false,
        }
    }

    fn at_or_after(&mut self, data: &[u8], pos: usize) -> Option<usize> {
        if self.exhausted {
            return None;
        }
        if let Some(found) = self.found.filter(|&found| found >= pos) {
            return Some(found);
        }
        match data.get(pos..).and_then(|rest| find(rest, self.needle)) {
            Some(offset) => {
                self.found = Some(pos + offset);
                self.found
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

/// Header and trailer lookups shared by every PDF candidate of one scan.
struct PdfMarkers {
    header: NextMatch,
    eof: NextMatch,
}

impl PdfMarkers {
    fn new() -> Self {
        Self {
            header: NextMatch::new(PDF_HEADER),
            eof: NextMatch::new(PDF_EOF),
        }
    }
}

/// `%PDF-` through the first `%%EOF` and its line ending. A second header
/// before that `%%EOF` means this document was cut short.
fn pdf_end(data: &[u8], start: usize, markers: &mut PdfMarkers) -> Option<usize> {
    let body_start = start + PDF_HEADER.len();
    let eof = markers.eof.at_or_after(data, body_start)?;
    if markers
        .header
        .at_or_after(data, body_start)
        .is_some_and(|header| header < eof)
    {
        return None;
    }

    let mut end = eof + PDF_EOF.len();
    if data.get(end) == Some(&b'\r') {
        end += 1;
    }
    if data.get(end) == Some(&b'\n') {
        end += 1;
    }
    Some(end)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Minimal structurally valid JPEG: SOI, APP0, SOS with entropy data, EOI.
    pub fn jpeg(payload: &[u8]) -> Vec<u8> {
        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x06, b'J', b'F', b'I', b'F']);
        jpeg.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x04, 0x01, 0x00]);
        jpeg.extend_from_slice(payload);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        jpeg
    }

    pub fn png() -> Vec<u8> {
        let mut png = super::PNG_SIGNATURE.to_vec();
        png.extend_from_slice(&13u32.to_be_bytes());
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 1, 8, 2, 0, 0, 0]);
        png.extend_from_slice(&[0; 4]);
        png.extend_from_slice(&0u32.to_be_bytes());
        png.extend_from_slice(b"IEND");
        png.extend_from_slice(&[0xAE, 0x42, 0x60, 0x82]);
        png
    }

    pub fn pdf(body: &str) -> Vec<u8> {
        format!("%PDF-1.4\n{}\n%%EOF\n", body).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_complete_then_truncated_jpeg() {
        let complete = jpeg(b"\x12\x34\x56");
        let mut container = b"header text ".to_vec();
        container.extend_from_slice(&complete);
        container.extend_from_slice(b" between ");
        // no EOI
        container.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00, 0x11]);

        let carved = carve(&Bytes::from(container), "parent-1");
        assert_eq!(carved.len(), 1);
        assert_eq!(carved[0].bytes.as_ref(), complete.as_slice());
        assert_eq!(carved[0].filename, "embedded_1.jpg");
        assert_eq!(carved[0].mime_type.as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn test_eoi_bytes_inside_entropy_data_are_stuffed() {
        // FF 00 is a literal FF in scan data, FF D0 a restart marker
        let tricky = jpeg(&[0x01, 0xFF, 0x00, 0xD9, 0xFF, 0xD0, 0x02]);
        let ranges = find_embedded(&tricky);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].end, tricky.len());
    }

    #[test]
    fn test_mixed_formats_in_order() {
        let mut container = Vec::new();
        container.extend_from_slice(&png());
        container.extend_from_slice(b"--boundary--");
        container.extend_from_slice(&pdf("1 0 obj << /Type /Page >> endobj"));
        container.extend_from_slice(&jpeg(b"\x00"));

        let kinds: Vec<_> = find_embedded(&container).iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![EmbeddedKind::Png, EmbeddedKind::Pdf, EmbeddedKind::Jpeg]
        );
    }

    #[test]
    fn test_truncated_png_is_skipped() {
        let mut png = png();
        png.truncate(png.len() - 6);
        assert!(find_embedded(&png).is_empty());
    }

    #[test]
    fn test_pdf_includes_trailing_newline() {
        let doc = pdf("body");
        let ranges = find_embedded(&doc);
        assert_eq!(ranges[0].end, doc.len());
    }

    #[test]
    fn test_pdf_cut_short_by_next_header() {
        let mut container = b"%PDF-1.3\nhalf a document ".to_vec();
        let whole = pdf("whole");
        container.extend_from_slice(&whole);

        let ranges = find_embedded(&container);
        assert_eq!(ranges.len(), 1);
        assert_eq!(&container[ranges[0].start..ranges[0].end], whole.as_slice());
    }

    #[test]
    fn test_many_bare_pdf_headers() {
        let mut container = b"%PDF-1.4 no trailer ".repeat(50_000);
        let whole = pdf("finally complete");
        container.extend_from_slice(&whole);
        container.extend_from_slice(&b"%PDF-".repeat(50_000));

        let ranges = find_embedded(&container);
        assert_eq!(ranges.len(), 1);
        assert_eq!(&container[ranges[0].start..ranges[0].end], whole.as_slice());
    }

    #[test]
    fn test_next_match_reuses_cached_position() {
        let data = b"..%%EOF....%%EOF..";
        let mut eof = NextMatch::new(PDF_EOF);

        assert_eq!(eof.at_or_after(data, 0), Some(2));
        assert_eq!(eof.at_or_after(data, 2), Some(2));
        assert_eq!(eof.at_or_after(data, 3), Some(11));
        assert_eq!(eof.at_or_after(data, 12), None);
        assert_eq!(eof.at_or_after(data, 13), None);
    }

    #[test]
    fn test_empty_and_plain_containers() {
        assert!(find_embedded(b"").is_empty());
        assert!(find_embedded(b"just some text, nothing embedded").is_empty());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(128))]

            #[test]
            fn prop_ranges_are_ordered_and_in_bounds(data in prop::collection::vec(any::<u8>(), 0..2048)) {
                let ranges = find_embedded(&data);
                let mut last_end = 0;
                for range in ranges {
                    prop_assert!(range.start >= last_end);
                    prop_assert!(range.start < range.end);
                    prop_assert!(range.end <= data.len());
                    last_end = range.end;
                }
            }

            #[test]
            fn prop_jpeg_survives_surrounding_noise(
                prefix in prop::collection::vec(0u8..0x80, 0..256),
                suffix in prop::collection::vec(0u8..0x80, 0..256),
            ) {
                let image = jpeg(b"\x10\x20\x30");
                let mut container = prefix.clone();
                container.extend_from_slice(&image);
                container.extend_from_slice(&suffix);

                let ranges = find_embedded(&container);
                prop_assert_eq!(ranges.len(), 1);
                prop_assert_eq!(ranges[0].start, prefix.len());
                prop_assert_eq!(ranges[0].end, prefix.len() + image.len());
            }
        }
    }
}
