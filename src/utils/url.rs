// src/utils/url.rs

//! URL manipulation utilities.
//!
//! Rules and documents meet in SURT form: the host reversed into
//! comma-separated labels inside a leading `(`, closed by `)` and followed
//! by the lower-cased path, e.g. `(au,gov,nla,trove,)/index.html`.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{AppError, Result};

static WWW_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^www\d*\.").unwrap_or_else(|e| panic!("bad pattern: {e}")));

static WWW_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",www\d*,$").unwrap_or_else(|e| panic!("bad pattern: {e}")));

static SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*://").unwrap_or_else(|e| panic!("bad pattern: {e}")));

static PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d{1,5}").unwrap_or_else(|e| panic!("bad pattern: {e}")));

/// SURT that every URL falls under.
pub const CATCH_ALL_SURT: &str = "(";

/// Convert a document URL into its canonical SURT.
///
/// Scheme, user info, port and fragment are dropped; host and path are
/// lower-cased and a leading `www` label is removed. URLs that cannot be
/// parsed collapse to [`CATCH_ALL_SURT`].
///
/// # Examples
/// ```
/// use warc_indexer::utils::url::to_surt;
///
/// assert_eq!(
///     to_surt("https://WWW.nla.gov.au:8080/Home.html#top"),
///     "(au,gov,nla,)/home.html"
/// );
/// ```
pub fn to_surt(raw: &str) -> String {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };

    let Ok(parsed) = url::Url::parse(&with_scheme) else {
        return CATCH_ALL_SURT.to_string();
    };
    let Some(host) = parsed.host_str() else {
        return CATCH_ALL_SURT.to_string();
    };

    let host = host.to_lowercase();
    let host = WWW_PREFIX.replace(&host, "");

    let mut surt = String::with_capacity(with_scheme.len() + 2);
    surt.push('(');
    for label in host.rsplit('.').filter(|l| !l.is_empty()) {
        surt.push_str(label);
        surt.push(',');
    }
    surt.push(')');
    surt.push_str(&parsed.path().to_lowercase());
    if let Some(query) = parsed.query() {
        surt.push('?');
        surt.push_str(query);
    }
    surt
}

/// Normalise a SURT pattern taken from a rule.
///
/// Any scheme and port are removed, the pattern is lower-cased and a
/// trailing `www` host label is dropped so it lines up with [`to_surt`].
pub fn canonical_rule_surt(raw: &str) -> Result<String> {
    let stripped = SCHEME.replace(raw.trim(), "");
    let stripped = PORT.replace(&stripped, "").to_lowercase();

    if !stripped.starts_with('(') {
        return Err(AppError::validation(format!(
            "SURT must start with '(': {raw}"
        )));
    }

    let (host, rest) = match stripped.find(')') {
        Some(idx) => stripped.split_at(idx),
        None => (stripped.as_str(), ""),
    };

    // "(au,gov,nla,www," carries a label that to_surt never produces
    let labels = &host[1..];
    let prefixed = format!(",{labels}");
    let trimmed = WWW_LABEL.replace(&prefixed, ",");
    let host = if trimmed.len() > 1 {
        trimmed[1..].to_string()
    } else {
        labels.to_string()
    };

    Ok(format!("({host}{rest}"))
}

/// Host spelled backwards, for suffix wildcards on sub-domains.
pub fn host_reversed(host: &str) -> String {
    host.chars().rev().collect()
}

/// Last non-empty path segment of a URL, if any.
pub fn filename(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_surt() {
        assert_eq!(
            to_surt("http://trove.nla.gov.au/index.html"),
            "(au,gov,nla,trove,)/index.html"
        );
        assert_eq!(
            to_surt("https://user:pw@www2.Example.COM:8443/A/B.html?x=1#frag"),
            "(com,example,)/a/b.html?x=1"
        );
        assert_eq!(to_surt("www.nla.gov.au"), "(au,gov,nla,)/");
    }

    #[test]
    fn test_to_surt_malformed() {
        assert_eq!(to_surt("http://"), CATCH_ALL_SURT);
        assert_eq!(to_surt(""), CATCH_ALL_SURT);
    }

    #[test]
    fn test_canonical_rule_surt() {
        assert_eq!(
            canonical_rule_surt("http://(au,gov,nla,trove,)/index.html").unwrap(),
            "(au,gov,nla,trove,)/index.html"
        );
        assert_eq!(
            canonical_rule_surt("(au,gov,nla,trove,:80)/home.html").unwrap(),
            "(au,gov,nla,trove,)/home.html"
        );
        assert_eq!(
            canonical_rule_surt("(AU,gov,nla,www,)/x").unwrap(),
            "(au,gov,nla,)/x"
        );
        assert_eq!(canonical_rule_surt("(au,").unwrap(), "(au,");
        assert_eq!(canonical_rule_surt("(").unwrap(), "(");
        assert!(canonical_rule_surt("au,gov,").is_err());
    }

    #[test]
    fn test_rule_and_document_surts_line_up() {
        let rule = canonical_rule_surt("(au,gov,nla,www,)/home.html").unwrap();
        assert!(to_surt("http://www.nla.gov.au/home.html").starts_with(&rule));
    }

    #[test]
    fn test_filename_and_host_reversed() {
        assert_eq!(
            filename("http://nla.gov.au/docs/report.pdf"),
            Some("report.pdf".to_string())
        );
        assert_eq!(filename("http://nla.gov.au/"), None);
        assert_eq!(host_reversed("trove.nla.gov.au"), "ua.vog.aln.evort");
    }
}
