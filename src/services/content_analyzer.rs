//! 内容分析器
//!
//! MIME resolution, category classification and per-category metadata.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::metadata_extractors::{ExtractorRegistry, MetadataExtractor, MetadataMap};
use super::mime_detector::{self, MimeAllowList};
use crate::error::Result;
use crate::infrastructure::config::AnalysisConfig;
use crate::models::ContentCategory;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub detected_mime_type: String,
    pub content_category: ContentCategory,
    pub extracted_metadata: MetadataMap,
}

#[derive(Debug, Default)]
pub struct ContentAnalyzer {
    extractors: ExtractorRegistry,
    allow_list: MimeAllowList,
}

impl ContentAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        Ok(Self {
            extractors: ExtractorRegistry::with_defaults(),
            allow_list: MimeAllowList::new(&config.allowed_mime_types)?,
        })
    }

    /// Swap in an extractor for its category.
    pub fn with_extractor(mut self, extractor: Box<dyn MetadataExtractor>) -> Self {
        self.extractors.register(extractor);
        self
    }

    /// Classify `content`. Only the allow-list can fail this call
    /// (`UnsupportedType`); extractor problems leave the metadata empty.
    pub fn analyze(
        &self,
        content: &[u8],
        declared_filename: Option<&str>,
        declared_mime: Option<&str>,
    ) -> Result<ContentAnalysis> {
        let (mime, source) = mime_detector::resolve(content, declared_filename, declared_mime);
        self.allow_list.check(&mime)?;

        let category = ContentCategory::from_mime(&mime);
        let metadata = self.extractors.extract(category, content, &mime);

        debug!(
            mime = %mime,
            source = %source,
            category = %category,
            fields = metadata.len(),
            "Content analyzed"
        );

        Ok(ContentAnalysis {
            detected_mime_type: mime,
            content_category: category,
            extracted_metadata: metadata,
        })
    }
}
