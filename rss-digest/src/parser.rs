use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::encoding::Decoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use tracing::{debug, info};

use crate::types::{ArticleCandidate, DigestError, FeedDialect, ParsedFeed, Result};
use crate::utils::doi::guess_doi;
use crate::utils::links::absolutize;
use crate::utils::text::{clean_opt, clean_text};

const RDF_NS: &[u8] = b"http://www.w3.org/1999/02/22-rdf-syntax-ns#";
const RSS1_NS: &[u8] = b"http://purl.org/rss/1.0/";
const DC_NS: &[u8] = b"http://purl.org/dc/elements/1.1/";
const CONTENT_NS: &[u8] = b"http://purl.org/rss/1.0/modules/content/";
const ATOM_NS: &[u8] = b"http://www.w3.org/2005/Atom";
// Every PRISM version lives under this prefix (basic/2.0, 1.2/basic, ...).
const PRISM_NS_PREFIX: &[u8] = b"http://prismstandard.org/namespaces/";

/// Turns RSS 2.0, Atom and RDF/RSS 1.0 payloads into article candidates.
///
/// The dialect is detected from the root element, never assumed. Items come
/// out in document order. Any structural problem (bad XML, truncated body,
/// unknown root) yields [`DigestError::FeedParse`] and no candidates.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedParser;

impl FeedParser {
    pub fn new() -> Self {
        Self
    }

    /// Candidates of a feed body, or a `FeedParse` error standing for an empty result.
    pub fn parse(&self, body: &[u8], feed_url: &str) -> Result<Vec<ArticleCandidate>> {
        self.parse_feed(body, feed_url).map(|feed| feed.candidates)
    }

    pub fn parse_feed(&self, body: &[u8], feed_url: &str) -> Result<ParsedFeed> {
        debug!(feed = feed_url, bytes = body.len(), "Parsing feed content");

        let scan = Scanner::scan(body).map_err(|reason| DigestError::FeedParse {
            url: feed_url.to_string(),
            reason,
        })?;

        let candidates: Vec<ArticleCandidate> = scan
            .items
            .into_iter()
            .map(|raw| raw.into_candidate(feed_url))
            .collect();

        info!(
            feed = feed_url,
            dialect = ?scan.dialect,
            items = candidates.len(),
            "Parsed feed"
        );

        Ok(ParsedFeed {
            dialect: scan.dialect,
            title: scan.feed_title.as_deref().and_then(clean_text),
            candidates,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ns {
    Plain,
    Rdf,
    Rss1,
    Dc,
    Prism,
    Content,
    Atom,
    Other,
}

impl Ns {
    fn classify(resolved: &ResolveResult) -> Self {
        match resolved {
            ResolveResult::Unbound => Ns::Plain,
            ResolveResult::Bound(Namespace(ns)) => match *ns {
                RDF_NS => Ns::Rdf,
                RSS1_NS => Ns::Rss1,
                DC_NS => Ns::Dc,
                CONTENT_NS => Ns::Content,
                ATOM_NS => Ns::Atom,
                ns if ns.starts_with(PRISM_NS_PREFIX) => Ns::Prism,
                _ => Ns::Other,
            },
            ResolveResult::Unknown(_) => Ns::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    DcTitle,
    Link,
    Guid,
    Published,
    DcDate,
    Updated,
    Description,
    Content,
    Doi,
    Journal,
    DcIdentifier,
}

fn item_field(ns: Ns, local: &str) -> Option<Field> {
    match (ns, local) {
        (Ns::Dc, "title") => Some(Field::DcTitle),
        (Ns::Dc, "date") => Some(Field::DcDate),
        (Ns::Dc, "identifier") => Some(Field::DcIdentifier),
        (Ns::Prism, "doi") => Some(Field::Doi),
        (Ns::Prism, "publicationName") => Some(Field::Journal),
        (Ns::Content, "encoded") => Some(Field::Content),
        (Ns::Plain | Ns::Rss1 | Ns::Atom, name) => match name {
            "title" => Some(Field::Title),
            "link" => Some(Field::Link),
            "guid" | "id" => Some(Field::Guid),
            "pubDate" | "published" => Some(Field::Published),
            "updated" => Some(Field::Updated),
            "description" | "summary" => Some(Field::Description),
            "content" => Some(Field::Content),
            _ => None,
        },
        _ => None,
    }
}

/// Fields of one `<item>`/`<entry>` exactly as found, before cleanup.
#[derive(Debug, Default)]
struct RawItem {
    title: Option<String>,
    dc_title: Option<String>,
    link: Option<String>,
    // Atom links: (rel, href) in document order
    atom_links: Vec<(String, String)>,
    guid: Option<String>,
    about: Option<String>,
    published: Option<String>,
    dc_date: Option<String>,
    updated: Option<String>,
    description: Option<String>,
    content: Option<String>,
    doi: Option<String>,
    journal: Option<String>,
    dc_identifier: Option<String>,
}

impl RawItem {
    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Title => &mut self.title,
            Field::DcTitle => &mut self.dc_title,
            Field::Link => &mut self.link,
            Field::Guid => &mut self.guid,
            Field::Published => &mut self.published,
            Field::DcDate => &mut self.dc_date,
            Field::Updated => &mut self.updated,
            Field::Description => &mut self.description,
            Field::Content => &mut self.content,
            Field::Doi => &mut self.doi,
            Field::Journal => &mut self.journal,
            Field::DcIdentifier => &mut self.dc_identifier,
        }
    }

    fn store(&mut self, field: Field, text: &str) {
        let text = text.trim();
        let slot = self.slot(field);
        if slot.is_none() && !text.is_empty() {
            *slot = Some(text.to_string());
        }
    }

    fn primary_link(&self) -> Option<String> {
        if let Some(link) = self.link.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            return Some(link.to_string());
        }
        self.atom_links
            .iter()
            .find(|(rel, _)| rel == "alternate")
            .or_else(|| self.atom_links.first())
            .map(|(_, href)| href.clone())
    }

    fn into_candidate(self, feed_url: &str) -> ArticleCandidate {
        let link = self.primary_link().map(|l| absolutize(feed_url, &l));
        let guid = self
            .guid
            .clone()
            .or_else(|| self.about.clone())
            .or_else(|| self.dc_identifier.clone());

        let doi = clean_opt(self.doi.as_deref()).or_else(|| {
            guess_doi([
                self.dc_identifier.as_deref(),
                self.guid.as_deref(),
                self.about.as_deref(),
                link.as_deref(),
                self.description.as_deref(),
            ])
        });

        let published_at = [&self.published, &self.dc_date, &self.updated]
            .into_iter()
            .flatten()
            .find_map(|raw| parse_feed_date(raw));

        let title = clean_opt(self.title.as_deref())
            .or_else(|| clean_opt(self.dc_title.as_deref()))
            .unwrap_or_default();

        ArticleCandidate {
            feed_url: feed_url.to_string(),
            raw_guid: guid.map(|g| g.trim().to_string()),
            link,
            doi,
            title,
            published_at,
            summary: clean_opt(self.description.as_deref())
                .or_else(|| clean_opt(self.content.as_deref())),
            journal: clean_opt(self.journal.as_deref()),
        }
    }
}

/// Parse the date formats feeds use: RFC 2822, RFC 3339, and bare dates.
pub fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }

    debug!(value = raw, "Unrecognized feed date");
    None
}

#[derive(Debug, Clone, Copy)]
enum Capture {
    ItemField(Field),
    FeedTitle,
}

struct Scanner {
    dialect: FeedDialect,
    feed_title: Option<String>,
    items: Vec<RawItem>,
    // local names of open elements, root first
    stack: Vec<String>,
    item: Option<RawItem>,
    item_depth: usize,
    capture: Option<(Capture, usize)>,
    text: String,
}

impl Scanner {
    fn scan(body: &[u8]) -> std::result::Result<Scanner, String> {
        let mut reader = NsReader::from_reader(body);
        let mut buf = Vec::new();
        let mut scanner: Option<Scanner> = None;

        loop {
            let (resolved, event) = reader
                .read_resolved_event_into(&mut buf)
                .map_err(|e| format!("malformed XML: {e}"))?;
            let ns = Ns::classify(&resolved);
            // Follows the encoding named by the BOM or the XML declaration.
            let decoder = reader.decoder();

            match event {
                Event::Start(start) => {
                    let local = local_name(&start);
                    let scanner = Self::ensure_root(&mut scanner, ns, &local)?;
                    scanner.open(ns, &local, &start, decoder);
                }
                Event::Empty(start) => {
                    let local = local_name(&start);
                    let scanner = Self::ensure_root(&mut scanner, ns, &local)?;
                    scanner.open(ns, &local, &start, decoder);
                    scanner.close();
                }
                Event::End(_) => {
                    if let Some(scanner) = scanner.as_mut() {
                        scanner.close();
                    }
                }
                Event::Text(text) => {
                    if let Some(scanner) = scanner.as_mut() {
                        let raw = decode(decoder, &text);
                        let unescaped = quick_xml::escape::unescape(&raw)
                            .map(|t| t.into_owned())
                            .unwrap_or_else(|_| raw.clone());
                        scanner.push_text(&unescaped);
                    }
                }
                Event::CData(cdata) => {
                    if let Some(scanner) = scanner.as_mut() {
                        scanner.push_text(&decode(decoder, &cdata));
                    }
                }
                Event::GeneralRef(reference) => {
                    if let Some(scanner) = scanner.as_mut() {
                        let name = String::from_utf8_lossy(&reference).into_owned();
                        scanner.push_text(&resolve_reference(&name));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        let scanner = scanner.ok_or_else(|| "document has no root element".to_string())?;
        if !scanner.stack.is_empty() {
            return Err(format!(
                "unexpected end of document inside <{}>",
                scanner.stack.last().map(String::as_str).unwrap_or_default()
            ));
        }
        Ok(scanner)
    }

    fn ensure_root<'s>(
        scanner: &'s mut Option<Scanner>,
        ns: Ns,
        local: &str,
    ) -> std::result::Result<&'s mut Scanner, String> {
        if scanner.is_none() {
            let dialect = match (local, ns) {
                ("rss", _) => FeedDialect::Rss2,
                ("RDF", Ns::Rdf | Ns::Plain) => FeedDialect::Rdf,
                ("feed", Ns::Atom | Ns::Plain) => FeedDialect::Atom,
                _ => return Err(format!("unrecognized feed root element <{local}>")),
            };
            *scanner = Some(Scanner {
                dialect,
                feed_title: None,
                items: Vec::new(),
                stack: Vec::new(),
                item: None,
                item_depth: 0,
                capture: None,
                text: String::new(),
            });
        } else if scanner.as_ref().is_some_and(|s| s.stack.is_empty()) {
            return Err(format!("unexpected second root element <{local}>"));
        }

        scanner
            .as_mut()
            .ok_or_else(|| "document has no root element".to_string())
    }

    fn item_element(&self) -> &'static str {
        match self.dialect {
            FeedDialect::Atom => "entry",
            FeedDialect::Rss2 | FeedDialect::Rdf => "item",
        }
    }

    fn is_feed_title_parent(&self, parent: &str) -> bool {
        match self.dialect {
            FeedDialect::Atom => self.stack.len() == 1,
            FeedDialect::Rss2 | FeedDialect::Rdf => parent == "channel",
        }
    }

    fn open(&mut self, ns: Ns, local: &str, start: &BytesStart, decoder: Decoder) {
        let depth = self.stack.len();

        if self.item.is_none() && local == self.item_element() {
            let mut item = RawItem::default();
            item.about = attribute(start, b"about", decoder);
            self.item = Some(item);
            self.item_depth = depth;
        } else if self.capture.is_none() {
            if let Some(item) = self.item.as_mut() {
                if depth == self.item_depth + 1 {
                    if let Some(field) = item_field(ns, local) {
                        match (field, attribute(start, b"href", decoder)) {
                            // Atom link: the value is in the attribute
                            (Field::Link, Some(href)) => {
                                let rel = attribute(start, b"rel", decoder)
                                    .unwrap_or_else(|| "alternate".to_string());
                                item.atom_links.push((rel, href));
                            }
                            _ => {
                                self.capture = Some((Capture::ItemField(field), depth));
                                self.text.clear();
                            }
                        }
                    }
                }
            } else if local == "title"
                && self.feed_title.is_none()
                && self
                    .stack
                    .last()
                    .is_some_and(|parent| self.is_feed_title_parent(parent))
            {
                self.capture = Some((Capture::FeedTitle, depth));
                self.text.clear();
            }
        }

        self.stack.push(local.to_string());
    }

    fn close(&mut self) {
        self.stack.pop();
        let depth = self.stack.len();

        if let Some((capture, capture_depth)) = self.capture {
            if depth == capture_depth {
                let text = std::mem::take(&mut self.text);
                match capture {
                    Capture::ItemField(field) => {
                        if let Some(item) = self.item.as_mut() {
                            item.store(field, &text);
                        }
                    }
                    Capture::FeedTitle => {
                        let title = text.trim();
                        if !title.is_empty() {
                            self.feed_title = Some(title.to_string());
                        }
                    }
                }
                self.capture = None;
            }
        }

        if self.item.is_some() && depth == self.item_depth {
            if let Some(item) = self.item.take() {
                self.items.push(item);
            }
        }
    }

    fn push_text(&mut self, text: &str) {
        if self.capture.is_some() {
            self.text.push_str(text);
        }
    }
}

fn local_name(start: &BytesStart) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn decode(decoder: Decoder, bytes: &[u8]) -> String {
    decoder
        .decode(bytes)
        .map(|text| text.into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned())
}

fn attribute(start: &BytesStart, wanted: &[u8], decoder: Decoder) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == wanted)
        .map(|attr| {
            let raw = decode(decoder, &attr.value);
            quick_xml::escape::unescape(&raw)
                .map(|v| v.into_owned())
                .unwrap_or(raw)
        })
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Expand an entity reference reported between text events.
fn resolve_reference(name: &str) -> String {
    if let Some(code) = name.strip_prefix('#') {
        let parsed = match code.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => code.parse::<u32>().ok(),
        };
        if let Some(ch) = parsed.and_then(char::from_u32) {
            return ch.to_string();
        }
    }

    match name {
        "amp" => "&".to_string(),
        "lt" => "<".to_string(),
        "gt" => ">".to_string(),
        "quot" => "\"".to_string(),
        "apos" => "'".to_string(),
        // HTML entities that publishers leak into XML
        "nbsp" => " ".to_string(),
        "ndash" => "\u{2013}".to_string(),
        "mdash" => "\u{2014}".to_string(),
        _ => format!("&{name};"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FEED: &str = "https://journal.example/rss";

    const RSS2: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Journal of Examples</title>
    <link>https://journal.example</link>
    <item>
      <title>Cells &amp; tissues</title>
      <link>https://journal.example/articles/1</link>
      <guid isPermaLink="false">article-1</guid>
      <pubDate>Fri, 05 Jan 2024 10:00:00 +0000</pubDate>
      <description><![CDATA[<p>Published as doi:10.1234/jex.2024.001.</p>]]></description>
    </item>
    <item>
      <title>Second article</title>
      <link>https://journal.example/articles/2</link>
      <dc:date>2024-01-06</dc:date>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Letters</title>
  <entry>
    <title type="html">Quantum &lt;i&gt;dots&lt;/i&gt;</title>
    <link rel="related" href="https://elsewhere.example/x"/>
    <link rel="alternate" href="https://letters.example/a/7"/>
    <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a</id>
    <published>2024-02-01T09:30:00Z</published>
    <summary>Short summary.</summary>
  </entry>
  <entry>
    <title>Relative link</title>
    <link href="/a/8"/>
    <updated>2024-02-02T00:00:00+02:00</updated>
  </entry>
</feed>"#;

    const RDF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#"
         xmlns="http://purl.org/rss/1.0/"
         xmlns:dc="http://purl.org/dc/elements/1.1/"
         xmlns:prism="http://prismstandard.org/namespaces/basic/2.0/">
  <channel rdf:about="https://nature.example/rss">
    <title>Nature Example</title>
  </channel>
  <item rdf:about="https://nature.example/articles/s41586-024-0001">
    <title>Deep sea vents</title>
    <link>https://nature.example/articles/s41586-024-0001</link>
    <dc:identifier>doi:10.1038/s41586-024-0001</dc:identifier>
    <dc:date>2024-03-10</dc:date>
    <prism:doi>10.1038/s41586-024-0001</prism:doi>
    <prism:publicationName>Nature</prism:publicationName>
  </item>
  <item rdf:about="https://nature.example/articles/s41586-024-0002">
    <dc:title>Only a DC title</dc:title>
    <link>https://nature.example/articles/s41586-024-0002</link>
  </item>
</rdf:RDF>"#;

    #[test]
    fn parses_rss2_items_in_order() {
        let feed = FeedParser::new().parse_feed(RSS2.as_bytes(), FEED).unwrap();
        assert_eq!(feed.dialect, FeedDialect::Rss2);
        assert_eq!(feed.title.as_deref(), Some("Journal of Examples"));
        assert_eq!(feed.candidates.len(), 2);

        let first = &feed.candidates[0];
        assert_eq!(first.title, "Cells & tissues");
        assert_eq!(first.link.as_deref(), Some("https://journal.example/articles/1"));
        assert_eq!(first.raw_guid.as_deref(), Some("article-1"));
        assert_eq!(first.doi.as_deref(), Some("10.1234/jex.2024.001"));
        assert_eq!(
            first.published_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap())
        );
        assert_eq!(first.summary.as_deref(), Some("Published as doi:10.1234/jex.2024.001."));

        let second = &feed.candidates[1];
        assert_eq!(second.title, "Second article");
        assert_eq!(second.raw_guid, None);
        assert_eq!(second.doi, None);
        assert_eq!(
            second.published_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn parses_atom_entries() {
        let feed = FeedParser::new()
            .parse_feed(ATOM.as_bytes(), "https://letters.example/feed")
            .unwrap();
        assert_eq!(feed.dialect, FeedDialect::Atom);
        assert_eq!(feed.title.as_deref(), Some("Atom Letters"));

        let first = &feed.candidates[0];
        assert_eq!(first.title, "Quantum dots");
        assert_eq!(first.link.as_deref(), Some("https://letters.example/a/7"));
        assert_eq!(
            first.raw_guid.as_deref(),
            Some("urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a")
        );
        assert_eq!(first.summary.as_deref(), Some("Short summary."));

        let second = &feed.candidates[1];
        assert_eq!(second.link.as_deref(), Some("https://letters.example/a/8"));
        assert_eq!(
            second.published_at,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 22, 0, 0).unwrap())
        );
    }

    #[test]
    fn parses_rdf_items_with_prism_fields() {
        let feed = FeedParser::new()
            .parse_feed(RDF.as_bytes(), "https://nature.example/rss")
            .unwrap();
        assert_eq!(feed.dialect, FeedDialect::Rdf);
        assert_eq!(feed.title.as_deref(), Some("Nature Example"));
        assert_eq!(feed.candidates.len(), 2);

        let first = &feed.candidates[0];
        assert_eq!(first.title, "Deep sea vents");
        assert_eq!(
            first.raw_guid.as_deref(),
            Some("https://nature.example/articles/s41586-024-0001")
        );
        assert_eq!(first.doi.as_deref(), Some("10.1038/s41586-024-0001"));
        assert_eq!(first.journal.as_deref(), Some("Nature"));

        let second = &feed.candidates[1];
        assert_eq!(second.title, "Only a DC title");
        assert_eq!(second.doi, None);
        assert_eq!(second.published_at, None);
    }

    #[test]
    fn truncated_feed_is_a_parse_error() {
        let truncated = &RSS2.as_bytes()[..RSS2.len() / 2];
        let err = FeedParser::new().parse(truncated, FEED).unwrap_err();
        assert!(matches!(err, DigestError::FeedParse { .. }));
    }

    #[test]
    fn mismatched_tags_and_garbage_are_parse_errors() {
        let parser = FeedParser::new();
        let mismatched = b"<rss><channel><item><title>x</item></channel></rss>";
        assert!(matches!(
            parser.parse(mismatched, FEED),
            Err(DigestError::FeedParse { .. })
        ));
        assert!(parser.parse(b"", FEED).is_err());
        assert!(parser.parse(b"<html><body>Not a feed</body></html>", FEED).is_err());
    }

    #[test]
    fn empty_channel_yields_no_candidates() {
        let body = b"<rss version=\"2.0\"><channel><title>Quiet</title></channel></rss>";
        let candidates = FeedParser::new().parse(body, FEED).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn declared_latin1_encoding_is_decoded() {
        let body: &[u8] = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\n\
            <rss version=\"2.0\"><channel><title>Revista Cient\xedfica</title>\n\
            <item><title>Caf\xe9 &amp; cr\xe8me</title><guid>lat-1</guid></item>\n\
            </channel></rss>";

        let feed = FeedParser::new().parse_feed(body, FEED).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Revista Científica"));
        assert_eq!(feed.candidates[0].title, "Café & crème");
    }

    #[test]
    fn feed_dates_accept_common_shapes() {
        assert!(parse_feed_date("Tue, 10 Jun 2003 04:00:00 GMT").is_some());
        assert!(parse_feed_date("2003-06-10T04:00:00").is_some());
        assert_eq!(parse_feed_date("sometime last week"), None);
    }
}
