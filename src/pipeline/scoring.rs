// src/pipeline/scoring.rs

//! Boost factors applied while building search records.
//!
//! Titles are scored twice: once for raw length and once for keyword
//! stuffing. Both return a multiplier in `(0, 1]`.

use std::collections::HashMap;

/// Multiplier for Australian government sites.
pub const BONUS_GOV: f32 = 1.35;

/// Multiplier for Australian education sites.
pub const BONUS_EDU: f32 = 1.1;

/// Multiplier for metadata-only records and office formats.
pub const MALUS_SEARCH_CATEGORY: f32 = 0.9;

/// Share of the SEO malus kept for trusted sites.
pub const SEO_SOFTENING: f32 = 0.3;

/// Penalty for overly long titles.
pub fn length_malus(title: &str) -> f32 {
    let len = title.chars().count();
    match len {
        0..100 => 1.0,
        100_000.. => 0.3,
        10_000.. => 0.5,
        2_000.. => 0.6,
        1_000.. => 0.7,
        500.. => 0.8,
        200.. => 0.9,
        _ => 0.95,
    }
}

/// Penalty for titles padded with repeated keywords.
///
/// Combines the length malus with how few distinct words the title uses
/// and how often its most common word repeats. Titles of five words or
/// fewer are never penalised.
pub fn seo_malus(title: &str) -> f32 {
    let histogram = Histogram::of_words(title);
    if histogram.size() <= 5 {
        return 1.0;
    }

    let size = histogram.size() as f32;
    let width_severity = 1.0 - histogram.width() as f32 / size;

    let height = histogram.height();
    let mut worst_dup = if height > 1 { height as f32 / size } else { 0.0 };
    if worst_dup < 0.1 && height < 1000 {
        worst_dup = 0.0;
    }

    length_malus(title)
        * MALUS_SEARCH_CATEGORY
        * (1.0 - width_severity * 0.9)
        * (1.0 - worst_dup * 0.95)
}

/// Apply `seo_malus` with only part of its strength.
pub fn soften(malus: f32) -> f32 {
    1.0 - (1.0 - malus) * SEO_SOFTENING
}

/// Word counts of a lower-cased, punctuation-free text.
#[derive(Debug, Default)]
pub struct Histogram {
    counts: HashMap<String, usize>,
    size: usize,
}

impl Histogram {
    pub fn of_words(text: &str) -> Self {
        let cleaned: String = text
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .collect();

        let mut histogram = Self::default();
        for word in cleaned.split_whitespace() {
            *histogram.counts.entry(word.to_string()).or_default() += 1;
            histogram.size += 1;
        }
        histogram
    }

    /// Total number of words.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of distinct words.
    pub fn width(&self) -> usize {
        self.counts.len()
    }

    /// Count of the most frequent word.
    pub fn height(&self) -> usize {
        self.counts.values().copied().max().unwrap_or(0)
    }
}
