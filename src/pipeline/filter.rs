// src/pipeline/filter.rs

//! Filter stage: quality control and restriction lookup.

use std::sync::Arc;

use crate::error::Result;
use crate::models::{ContentThreshold, Document, PipelineConfig, Rule, SearchCategory};
use crate::restrictions::RestrictionEngine;

/// Decides how much of a document is worth indexing.
#[derive(Debug, Clone)]
pub struct QualityControl {
    full_text_suffixes: Vec<String>,
    partial_threshold: ContentThreshold,
    pandora_collection_id: u64,
}

impl QualityControl {
    pub fn new(config: &PipelineConfig, pandora_collection_id: u64) -> Self {
        Self {
            full_text_suffixes: config
                .full_text_suffixes
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            partial_threshold: config.partial_threshold,
            pandora_collection_id,
        }
    }

    /// Content threshold for a fetched document.
    ///
    /// Failed captures keep their metadata only. Searchable formats are
    /// indexed in full for the configured sites and for pandora content,
    /// and partially everywhere else.
    pub fn threshold(&self, doc: &Document) -> ContentThreshold {
        if doc.status_code != 200 {
            return ContentThreshold::MetadataOnly;
        }
        if SearchCategory::from_content_type(&doc.content_type).is_none() {
            return ContentThreshold::MetadataOnly;
        }

        let site = doc.site.to_lowercase();
        let full_text_site = self
            .full_text_suffixes
            .iter()
            .any(|suffix| site.ends_with(suffix.as_str()));

        if full_text_site || self.is_pandora(doc) {
            ContentThreshold::FullText
        } else {
            self.partial_threshold
        }
    }

    pub fn is_pandora(&self, doc: &Document) -> bool {
        doc.in_collection(self.pandora_collection_id)
    }
}

/// What the filter stage decided for one document.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    /// Absent only when the threshold is `None`
    pub rule: Option<Arc<Rule>>,
    pub threshold: ContentThreshold,
    pub pandora: bool,
}

/// Run quality control, then the restriction engine unless nothing will
/// be indexed.
pub fn apply_filter(
    quality: &QualityControl,
    engine: &RestrictionEngine,
    doc: &Document,
) -> Result<FilterOutcome> {
    let threshold = quality.threshold(doc);
    let pandora = quality.is_pandora(doc);

    if !threshold.is_indexed() {
        return Ok(FilterOutcome {
            rule: None,
            threshold,
            pandora,
        });
    }

    let rule = engine.filter_document(&doc.url, doc.date)?;
    Ok(FilterOutcome {
        rule: Some(rule),
        threshold,
        pandora,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CollectionInfo, Policy};
    use crate::restrictions::RuleSet;
    use crate::testing::document;

    fn quality() -> QualityControl {
        QualityControl::new(&PipelineConfig::default(), 4)
    }

    fn engine() -> RestrictionEngine {
        RestrictionEngine::new(
            RuleSet::build(vec![
                Rule::builder(1, Policy::Accepted, "(").build().unwrap(),
                Rule::builder(2, Policy::RestrictedForBoth, "(com,example,)/private")
                    .build()
                    .unwrap(),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_threshold_by_status_and_type() {
        let qc = quality();

        let mut doc = document("http://example.com/a.html", 1);
        assert_eq!(qc.threshold(&doc), ContentThreshold::DocumentStartOnly);

        doc.status_code = 404;
        assert_eq!(qc.threshold(&doc), ContentThreshold::MetadataOnly);

        doc.status_code = 200;
        doc.content_type = "image/png".into();
        assert_eq!(qc.threshold(&doc), ContentThreshold::MetadataOnly);
    }

    #[test]
    fn test_full_text_for_gov_and_pandora() {
        let qc = quality();

        let gov = document("http://www.nla.gov.au/a.html", 1);
        assert_eq!(qc.threshold(&gov), ContentThreshold::FullText);

        let mut pandora = document("http://example.com/a.pdf", 2);
        pandora.content_type = "application/pdf".into();
        pandora.collections.push(CollectionInfo {
            id: 4,
            name: "pandora".into(),
        });
        assert!(qc.is_pandora(&pandora));
        assert_eq!(qc.threshold(&pandora), ContentThreshold::FullText);
    }

    #[test]
    fn test_filter_attaches_rule() {
        let outcome = apply_filter(
            &quality(),
            &engine(),
            &document("http://example.com/private/x.html", 1),
        )
        .unwrap();
        assert_eq!(outcome.rule.unwrap().id(), 2);
        assert_eq!(outcome.threshold, ContentThreshold::DocumentStartOnly);
    }

    #[test]
    fn test_filter_is_idempotent() {
        let qc = quality();
        let engine = engine();
        let doc = document("http://example.com/private/x.html", 1);

        let first = apply_filter(&qc, &engine, &doc).unwrap();
        let second = apply_filter(&qc, &engine, &doc).unwrap();
        assert_eq!(first.threshold, second.threshold);
        assert_eq!(
            first.rule.unwrap().policy(),
            second.rule.unwrap().policy()
        );
    }

    #[test]
    fn test_filter_fails_when_locked_down() {
        let engine = engine();
        engine.lock_down("test");
        let doc = document("http://example.com/a.html", 1);
        assert!(apply_filter(&quality(), &engine, &doc).is_err());
    }
}
