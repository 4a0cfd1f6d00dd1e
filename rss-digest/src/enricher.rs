//! Page Enricher: reads an article's landing page and fills in what the feed
//! left out.
//!
//! Each field is taken from the first source that has it: JSON-LD structured
//! data, then `<meta>` tag conventions (Highwire `citation_*`, Dublin Core,
//! PRISM, Open Graph), then visible-text heuristics for the abstract.
//! Page values win over feed values; feed values fill the gaps.

use crate::fetcher::Fetcher;
use crate::parser::parse_feed_date;
use crate::traits::PageEnricher;
use crate::types::{ArticleCandidate, DigestError, EnrichedArticle, Result};
use crate::utils::doi::guess_doi;
use crate::utils::text::{clean_text, collapse_whitespace};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const ARTICLE_TYPES: &[&str] = &["Article", "ScholarlyArticle", "NewsArticle"];

static JSONLD_SELECTOR: Lazy<Selector> =
    Lazy::new(|| selector(r#"script[type="application/ld+json"]"#));
static META_SELECTOR: Lazy<Selector> = Lazy::new(|| selector("meta[content]"));
static ID_ABSTRACT_SELECTOR: Lazy<Selector> = Lazy::new(|| selector("section[id], div[id], p[id]"));
static CLASS_ABSTRACT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| selector("section[class], div[class]"));
static HEADING_SELECTOR: Lazy<Selector> = Lazy::new(|| selector("h1, h2, h3, h4, h5, h6"));

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector is valid")
}

/// Metadata read from a landing page. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub journal: Option<String>,
    pub article_type: Option<String>,
    pub doi: Option<String>,
    pub published: Option<String>,
    pub abstract_text: Option<String>,
}

impl PageMetadata {
    /// Fill fields that are still empty from `other`.
    fn or(self, other: PageMetadata) -> PageMetadata {
        PageMetadata {
            title: self.title.or(other.title),
            journal: self.journal.or(other.journal),
            article_type: self.article_type.or(other.article_type),
            doi: self.doi.or(other.doi),
            published: self.published.or(other.published),
            abstract_text: self.abstract_text.or(other.abstract_text),
        }
    }
}

/// Enricher that fetches the landing page over HTTP, exactly once per article.
pub struct HttpPageEnricher {
    fetcher: Arc<Fetcher>,
}

impl HttpPageEnricher {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }

    async fn read_page(&self, url: &str) -> Result<PageMetadata> {
        let html = self.fetcher.fetch_page(url).await?;
        extract_page_metadata(url, &html)
    }
}

#[async_trait]
impl PageEnricher for HttpPageEnricher {
    async fn enrich(&self, candidate: ArticleCandidate) -> EnrichedArticle {
        let Some(url) = candidate.link.clone() else {
            let mut article = EnrichedArticle::from_candidate(candidate);
            article.enrichment_error = Some("feed item has no link".to_string());
            return article;
        };

        match self.read_page(&url).await {
            Ok(metadata) => {
                debug!(url = %url, "Enriched article from landing page");
                merge_page_metadata(candidate, metadata)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Enrichment failed, keeping feed fields");
                EnrichedArticle::from_candidate(candidate).with_enrichment_error(&e)
            }
        }
    }
}

/// Combine a candidate with what its landing page said; page values win.
pub fn merge_page_metadata(candidate: ArticleCandidate, page: PageMetadata) -> EnrichedArticle {
    let mut article = EnrichedArticle::from_candidate(candidate);

    if let Some(title) = page.title {
        article.title_en = title;
    }
    article.journal_name = page.journal.or(article.journal_name);
    article.article_type = page.article_type;
    article.doi = page.doi.or(article.doi);
    article.published = page.published.or(article.published);
    article.abstract_en = page.abstract_text;
    article
}

/// Pull article metadata out of a landing page's HTML.
pub fn extract_page_metadata(url: &str, html: &str) -> Result<PageMetadata> {
    let trimmed = html.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Err(DigestError::PageParse {
            url: url.to_string(),
            reason: "empty response body".to_string(),
        });
    }
    if !trimmed.starts_with('<') {
        return Err(DigestError::PageParse {
            url: url.to_string(),
            reason: "response is not an HTML document".to_string(),
        });
    }

    let document = Html::parse_document(trimmed);

    let structured = jsonld_article(&document)
        .map(|article| from_jsonld(&article))
        .unwrap_or_default();

    let mut metadata = structured.or(from_meta_tags(&document));
    if metadata.abstract_text.is_none() {
        metadata.abstract_text = visible_abstract(&document);
    }
    metadata.abstract_text = metadata.abstract_text.map(|text| strip_abstract_label(&text));
    metadata.published = metadata.published.map(|raw| normalize_date(&raw));

    Ok(metadata)
}

fn jsonld_article(document: &Html) -> Option<Value> {
    document
        .select(&JSONLD_SELECTOR)
        .filter_map(|script| {
            let raw = script.text().collect::<String>();
            serde_json::from_str::<Value>(raw.trim()).ok()
        })
        .find_map(|value| find_article(&value).cloned())
}

fn find_article(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.iter().find_map(find_article),
        Value::Object(map) => {
            if map.get("@type").is_some_and(is_article_type) {
                return Some(value);
            }
            map.get("@graph").and_then(find_article)
        }
        _ => None,
    }
}

fn is_article_type(value: &Value) -> bool {
    type_names(value).any(|name| ARTICLE_TYPES.contains(&name))
}

fn type_names(value: &Value) -> impl Iterator<Item = &str> {
    let names: Vec<&str> = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    // "schema:ScholarlyArticle", "http://schema.org/Article"
    names
        .into_iter()
        .map(|name| name.rsplit([':', '/']).next().unwrap_or(name))
}

/// First usable string in a JSON-LD value: a string, an `@value` object or a list of those.
fn json_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => clean_text(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("@value").and_then(json_string),
        Value::Array(items) => items.iter().find_map(json_string),
        _ => None,
    }
}

fn field(article: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| article.get(*key))
        .find_map(json_string)
}

fn from_jsonld(article: &Value) -> PageMetadata {
    PageMetadata {
        title: field(article, &["headline", "name"]),
        journal: jsonld_journal(article),
        article_type: field(article, &["articleSection"]),
        doi: jsonld_doi(article),
        published: field(article, &["datePublished", "dateCreated"]),
        abstract_text: field(article, &["abstract", "description"]),
    }
}

/// Walk the `isPartOf` chain (issue, volume, periodical) and prefer the periodical's name.
fn jsonld_journal(article: &Value) -> Option<String> {
    let mut names = Vec::new();
    let mut current = article.get("isPartOf");
    while let Some(part) = current {
        let part = match part {
            Value::Array(items) => match items.first() {
                Some(first) => first,
                None => break,
            },
            other => other,
        };
        if let Some(name) = part.get("name").and_then(json_string) {
            let periodical = part
                .get("@type")
                .is_some_and(|t| type_names(t).any(|n| n == "Periodical"));
            names.push((periodical, name));
        }
        current = part.get("isPartOf");
    }

    names
        .iter()
        .find(|(periodical, _)| *periodical)
        .or_else(|| names.first())
        .map(|(_, name)| name.clone())
        .or_else(|| {
            article
                .get("publisher")
                .and_then(|publisher| publisher.get("name"))
                .and_then(json_string)
        })
}

fn jsonld_doi(article: &Value) -> Option<String> {
    let mut texts: Vec<String> = Vec::new();
    for key in ["identifier", "@id", "sameAs", "url"] {
        if let Some(value) = article.get(key) {
            collect_identifier_strings(value, &mut texts);
        }
    }
    guess_doi(texts.iter().map(|s| Some(s.as_str())))
}

fn collect_identifier_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|item| collect_identifier_strings(item, out)),
        Value::Object(map) => {
            for key in ["value", "@value", "@id"] {
                if let Some(Value::String(s)) = map.get(key) {
                    out.push(s.clone());
                }
            }
        }
        _ => {}
    }
}

fn from_meta_tags(document: &Html) -> PageMetadata {
    let mut metas: HashMap<String, String> = HashMap::new();
    for meta in document.select(&META_SELECTOR) {
        let element = meta.value();
        let Some(key) = element.attr("name").or_else(|| element.attr("property")) else {
            continue;
        };
        let Some(content) = element.attr("content").and_then(clean_text) else {
            continue;
        };
        metas.entry(key.trim().to_lowercase()).or_insert(content);
    }

    PageMetadata {
        title: pick_meta(&metas, &["citation_title", "dc.title", "og:title"]),
        journal: pick_meta(
            &metas,
            &["citation_journal_title", "prism.publicationname", "og:site_name"],
        ),
        article_type: pick_meta(&metas, &["citation_article_type", "dc.type"]),
        doi: pick_meta(&metas, &["citation_doi", "dc.identifier", "prism.doi"])
            .and_then(|raw| guess_doi([Some(raw.as_str())])),
        published: pick_meta(&metas, &[
            "citation_publication_date",
            "citation_online_date",
            "citation_date",
            "dc.date",
            "prism.publicationdate",
            "article:published_time",
        ]),
        abstract_text: pick_meta(&metas, &[
            "citation_abstract",
            "dc.description",
            "description",
            "og:description",
        ]),
    }
}

fn pick_meta(metas: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| metas.get(*key).cloned())
}

fn element_text(element: ElementRef) -> Option<String> {
    let text = collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "));
    (!text.is_empty()).then_some(text)
}

fn visible_abstract(document: &Html) -> Option<String> {
    let by_id = document
        .select(&ID_ABSTRACT_SELECTOR)
        .filter(|el| {
            el.value()
                .attr("id")
                .is_some_and(|id| id.to_lowercase().contains("abstract"))
        })
        .find_map(element_text);
    if by_id.is_some() {
        return by_id;
    }

    let by_class = document
        .select(&CLASS_ABSTRACT_SELECTOR)
        .filter(|el| {
            el.value()
                .classes()
                .any(|class| class.to_lowercase().contains("abstract"))
        })
        .find_map(element_text);
    if by_class.is_some() {
        return by_class;
    }

    document
        .select(&HEADING_SELECTOR)
        .filter(|heading| {
            element_text(*heading).is_some_and(|text| {
                text.trim_end_matches(':').eq_ignore_ascii_case("abstract")
            })
        })
        .find_map(|heading| {
            heading
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .find_map(element_text)
        })
}

fn strip_abstract_label(text: &str) -> String {
    let trimmed = text.trim();
    let is_label_sep = |c: char| c == ':' || c == '.' || c.is_whitespace();

    if let (Some(head), Some(rest)) = (trimmed.get(..8), trimmed.get(8..)) {
        // "Abstract: ..." but not "Abstracting ..."
        if head.eq_ignore_ascii_case("abstract") && rest.starts_with(is_label_sep) {
            let rest = rest.trim_start_matches(is_label_sep);
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }
    trimmed.to_string()
}

fn normalize_date(raw: &str) -> String {
    parse_feed_date(raw)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| raw.trim().replace('/', "-"))
}
