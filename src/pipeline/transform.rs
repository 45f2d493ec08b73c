// src/pipeline/transform.rs

//! Transform stage: turn a filtered document into a search record.
//!
//! The content threshold decides how much body text is kept:
//!
//! | Threshold             | Text                                   |
//! |-----------------------|----------------------------------------|
//! | `METADATA_ONLY`       | none                                   |
//! | `UNIQUE_TERMS_ONLY`   | distinct terms, stopwords removed      |
//! | `DOCUMENT_START_ONLY` | leading text, cut at a word boundary   |
//! | `FULL_TEXT`           | everything                             |

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Utc};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{AppError, Result};
use crate::models::{ContentThreshold, Document, PipelineConfig, SearchCategory};
use crate::pipeline::filter::FilterOutcome;
use crate::pipeline::scoring::{
    BONUS_EDU, BONUS_GOV, MALUS_SEARCH_CATEGORY, length_malus, seo_malus, soften,
};
use crate::services::SearchRecord;
use crate::utils::url::{filename, host_reversed, to_surt};
use crate::utils::{remove_extra_spaces, shorten_text};

/// Minimum term length kept at `UNIQUE_TERMS_ONLY`.
const MIN_TERM_LENGTH: usize = 2;

/// Builds search records according to the pipeline settings.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    text_limit: usize,
    unique_terms_limit: usize,
    index_full_text: bool,
}

impl RecordBuilder {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            text_limit: config.text_limit,
            unique_terms_limit: config.unique_terms_limit,
            index_full_text: config.index_full_text,
        }
    }

    /// Build the record for `doc`, or `None` when nothing is indexed.
    pub fn build(
        &self,
        id: &str,
        doc: &Document,
        outcome: &FilterOutcome,
        indexed_at: DateTime<Utc>,
    ) -> Result<Option<SearchRecord>> {
        if !outcome.threshold.is_indexed() {
            return Ok(None);
        }

        let rule = outcome
            .rule
            .as_ref()
            .ok_or_else(|| AppError::validation(format!("{id} reached transform without a rule")))?;

        let delivery_url = doc
            .delivery_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| AppError::validation(format!("{id} has no delivery URL")))?;

        let site = doc.site.to_lowercase();
        let mut boost = 1.0_f32;
        let mut au_gov = false;
        let mut trusted = false;
        if site.ends_with(".gov.au") {
            boost *= BONUS_GOV;
            au_gov = true;
            trusted = true;
        } else if site.ends_with(".edu.au") {
            boost *= BONUS_EDU;
            trusted = true;
        }

        let title = doc
            .title
            .as_deref()
            .map(remove_extra_spaces)
            .filter(|t| !t.is_empty());
        if let Some(title) = &title {
            boost *= length_malus(title);
            let seo = seo_malus(title);
            boost *= if trusted { soften(seo) } else { seo };
        }

        let metadata: Vec<String> = doc
            .metadata()
            .map(remove_extra_spaces)
            .filter(|m| !m.is_empty())
            .collect();

        let policy = rule.policy();

        let search_category = if outcome.threshold == ContentThreshold::MetadataOnly {
            boost *= MALUS_SEARCH_CATEGORY;
            SearchCategory::None
        } else {
            let category =
                SearchCategory::from_content_type(&doc.content_type).unwrap_or(SearchCategory::None);
            if category.is_office_format() {
                boost *= MALUS_SEARCH_CATEGORY;
            }
            category
        };

        let fulltext = if self.index_full_text {
            self.body_text(doc, outcome.threshold)
                .filter(|t| !t.is_empty())
        } else {
            None
        };

        let year = doc.date.year();
        Ok(Some(SearchRecord {
            id: id.to_string(),
            url: doc.url.clone(),
            delivery_url: delivery_url.to_string(),
            pandora_url: doc.pandora_url.clone().filter(|u| !u.is_empty()),
            filename: filename(&doc.url),
            date: doc.date,
            year,
            decade: year / 10,
            site: doc.site.clone(),
            host: doc.host.clone(),
            host_reversed: host_reversed(&doc.host),
            surt: to_surt(&doc.url),
            title,
            metadata,
            au_gov,
            rule_id: rule.id(),
            policy,
            deliverable: policy.is_deliverable(),
            discoverable: policy.is_discoverable(),
            text_error: doc.text_error.is_some(),
            search_category,
            fulltext,
            boost,
            last_indexed: indexed_at,
        }))
    }

    fn body_text(&self, doc: &Document, threshold: ContentThreshold) -> Option<String> {
        let text = doc.text.as_deref()?;
        match threshold {
            ContentThreshold::FullText => Some(remove_extra_spaces(text)),
            ContentThreshold::DocumentStartOnly => {
                Some(shorten_text(&remove_extra_spaces(text), self.text_limit))
            }
            ContentThreshold::UniqueTermsOnly => {
                Some(unique_terms(text, self.unique_terms_limit).join(" "))
            }
            ContentThreshold::MetadataOnly | ContentThreshold::None => None,
        }
    }
}

/// Distinct lower-cased terms in order of first appearance.
pub fn unique_terms(text: &str, limit: usize) -> Vec<String> {
    let normalized = text.to_lowercase();
    let mut seen = HashSet::new();
    normalized
        .unicode_words()
        .filter(|word| word.chars().count() >= MIN_TERM_LENGTH)
        .filter(|word| !is_stopword(word))
        .filter(|word| seen.insert(*word))
        .take(limit)
        .map(String::from)
        .collect()
}

fn is_stopword(word: &str) -> bool {
    const STOPWORDS: &[&str] = &[
        "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
        "do", "does", "did", "will", "would", "could", "should", "may", "might", "can", "must",
        "shall", "of", "to", "in", "for", "on", "with", "at", "by", "from", "as", "or", "and",
        "but", "if", "then", "so", "than", "this", "that", "it", "its", "not", "no",
    ];
    STOPWORDS.contains(&word)
}
