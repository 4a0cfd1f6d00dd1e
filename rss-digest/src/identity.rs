//! Deduplication keys for feed items.
//!
//! Every candidate maps to exactly one [`ArticleIdentity`], chosen from the first
//! usable identifier in this order: DOI, feed GUID, article link, and finally a
//! hash of feed URL + title + publication date. The chosen value is normalized,
//! hashed and prefixed with a tag naming which rule produced it, so keys have a
//! fixed length and never contain storage delimiters.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::types::ArticleCandidate;
use crate::utils::text::collapse_whitespace;

/// Length of every identity string: three-letter tag, `:`, 64 hex digits.
pub const IDENTITY_LEN: usize = 68;

const DOI_PREFIXES: &[&str] = &[
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "doi.org/",
    "doi:",
];

// Query parameters that identify the referrer rather than the article.
// `af` is the marker AAAS appends to links in its RSS feeds.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "mc_cid", "mc_eid", "_hsenc", "_hsmi", "igshid",
    "yclid", "ref_src", "wt.mc_id", "cmpid", "af",
];

/// Which rule of the precedence chain produced an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    Doi,
    Guid,
    Link,
    /// Feed + title + date hash; fragile against title edits between refreshes.
    Fallback,
}

impl IdentityKind {
    fn tag(self) -> &'static str {
        match self {
            IdentityKind::Doi => "doi",
            IdentityKind::Guid => "gid",
            IdentityKind::Link => "url",
            IdentityKind::Fallback => "fbk",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "doi" => Some(IdentityKind::Doi),
            "gid" => Some(IdentityKind::Guid),
            "url" => Some(IdentityKind::Link),
            "fbk" => Some(IdentityKind::Fallback),
            _ => None,
        }
    }
}

/// Opaque dedup key of an article.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArticleIdentity(String);

impl ArticleIdentity {
    fn from_parts(kind: IdentityKind, normalized: &str) -> Self {
        let digest = Sha256::digest(normalized.as_bytes());
        Self(format!("{}:{:x}", kind.tag(), digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> Option<IdentityKind> {
        self.0.split_once(':').and_then(|(tag, _)| IdentityKind::from_tag(tag))
    }

    pub fn is_fallback(&self) -> bool {
        self.kind() == Some(IdentityKind::Fallback)
    }
}

impl fmt::Display for ArticleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the identity of a candidate. Total: never fails, never skips.
pub fn resolve(candidate: &ArticleCandidate) -> ArticleIdentity {
    if let Some(doi) = candidate.doi.as_deref().and_then(normalize_doi) {
        return ArticleIdentity::from_parts(IdentityKind::Doi, &doi);
    }

    if let Some(guid) = non_empty(candidate.raw_guid.as_deref()) {
        // A permalink GUID shares the link keyspace so it matches the same link elsewhere.
        if let Some(url) = normalize_url(guid) {
            return ArticleIdentity::from_parts(IdentityKind::Link, &url);
        }
        return ArticleIdentity::from_parts(IdentityKind::Guid, guid);
    }

    if let Some(link) = non_empty(candidate.link.as_deref()) {
        let normalized = normalize_url(link).unwrap_or_else(|| link.to_string());
        return ArticleIdentity::from_parts(IdentityKind::Link, &normalized);
    }

    fallback_identity(candidate)
}

fn fallback_identity(candidate: &ArticleCandidate) -> ArticleIdentity {
    let title = collapse_whitespace(&candidate.title).to_lowercase();
    let date = candidate
        .published_at
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let material = format!("{}\n{}\n{}", candidate.feed_url.trim(), title, date);
    ArticleIdentity::from_parts(IdentityKind::Fallback, &material)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Lowercase a DOI and strip resolver prefixes. `None` when nothing remains.
pub fn normalize_doi(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let mut doi = lowered.as_str();
    for prefix in DOI_PREFIXES {
        if let Some(rest) = doi.strip_prefix(prefix) {
            doi = rest.trim_start();
            break;
        }
    }

    let doi = doi.trim();
    if doi.is_empty() {
        None
    } else {
        Some(doi.to_string())
    }
}

/// Canonical form of an http(s) URL for identity purposes.
///
/// Drops the fragment and tracking parameters, lowercases scheme and host
/// (done by the `url` parser) and removes trailing slashes from the path.
/// Returns `None` for anything that is not an absolute http(s) URL.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let trimmed = url.path().trim_end_matches('/').to_string();
    if trimmed.len() != url.path().len() {
        url.set_path(if trimmed.is_empty() { "/" } else { &trimmed });
    }

    Some(url.to_string())
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const FEED: &str = "https://journal.example/rss";

    fn candidate(title: &str) -> ArticleCandidate {
        ArticleCandidate::new(FEED, title)
    }

    #[test]
    fn doi_variants_share_an_identity() {
        let plain = resolve(&candidate("a").with_doi("10.1038/ABC.123"));
        let prefixed = resolve(&candidate("b").with_doi("https://doi.org/10.1038/abc.123"));
        let scheme = resolve(&candidate("c").with_doi("  doi:10.1038/Abc.123 "));

        assert_eq!(plain, prefixed);
        assert_eq!(plain, scheme);
        assert_eq!(plain.kind(), Some(IdentityKind::Doi));
    }

    #[test]
    fn doi_outranks_guid_and_link() {
        let with_doi = candidate("t")
            .with_doi("10.1/x")
            .with_guid("g1")
            .with_link("https://journal.example/a");
        let doi_only = candidate("other").with_doi("10.1/X");
        assert_eq!(resolve(&with_doi), resolve(&doi_only));
    }

    #[test]
    fn blank_doi_falls_through_to_guid() {
        let c = candidate("t").with_doi("   ").with_guid("g1");
        let id = resolve(&c);
        assert_eq!(id.kind(), Some(IdentityKind::Guid));
        assert_eq!(id, resolve(&candidate("different").with_guid(" g1 ")));
    }

    #[test]
    fn url_guid_matches_equivalent_link() {
        let by_guid =
            resolve(&candidate("a").with_guid("https://Journal.Example/articles/42/#top"));
        let tracked = "https://journal.example/articles/42?utm_source=rss";
        let by_link = resolve(&candidate("b").with_link(tracked));
        assert_eq!(by_guid, by_link);
        assert_eq!(by_link.kind(), Some(IdentityKind::Link));
    }

    #[test]
    fn link_normalization_keeps_meaningful_query() {
        let noisy = "HTTPS://Journal.Example/doi/full/?id=7&utm_medium=feed&fbclid=zz#abs";
        assert_eq!(
            normalize_url(noisy).as_deref(),
            Some("https://journal.example/doi/full?id=7")
        );
        assert_eq!(
            normalize_url("https://journal.example/").as_deref(),
            Some("https://journal.example/")
        );
        assert_eq!(normalize_url("mailto:editor@journal.example"), None);
    }

    #[test]
    fn fallback_is_deterministic_and_tagged() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
        let first = resolve(&candidate("A  Study\nof Things").with_published_at(date));
        let second = resolve(&candidate("a study of things").with_published_at(date));
        let later = Utc.with_ymd_and_hms(2024, 3, 1, 22, 0, 0).unwrap();
        let same_day = resolve(&candidate("A study of things").with_published_at(later));

        assert_eq!(first, second);
        assert_eq!(first, same_day);
        assert!(first.is_fallback());

        let other_feed = resolve(
            &ArticleCandidate::new("https://other.example/rss", "a study of things")
                .with_published_at(date),
        );
        assert_ne!(first, other_feed);
    }

    #[test]
    fn identities_have_fixed_length_and_single_separator() {
        let ids = [
            resolve(&candidate("a").with_doi("10.1/x")),
            resolve(&candidate("a").with_guid("tag:journal.example,2024:1")),
            resolve(&candidate("a").with_link("not a url at all")),
            resolve(&candidate("")),
        ];
        for id in ids {
            assert_eq!(id.as_str().len(), IDENTITY_LEN);
            assert_eq!(id.as_str().matches(':').count(), 1);
        }
    }
}
