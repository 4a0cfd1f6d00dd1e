/// Text cleanup shared by the feed parser, the page enricher and the renderer
pub mod text {
    use scraper::Html;

    /// Collapse runs of whitespace (including newlines) into single spaces and trim.
    pub fn collapse_whitespace(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Reduce a possibly marked-up string to plain, whitespace-collapsed text.
    ///
    /// Entities are decoded and tags dropped. Returns `None` when nothing is left.
    pub fn clean_text(raw: &str) -> Option<String> {
        let plain = if raw.contains('<') || raw.contains('&') {
            let fragment = Html::parse_fragment(raw);
            fragment.root_element().text().collect::<Vec<_>>().join(" ")
        } else {
            raw.to_string()
        };

        let cleaned = collapse_whitespace(&plain);
        if cleaned.is_empty() {
            None
        } else {
            Some(cleaned)
        }
    }

    /// `clean_text` over an optional value.
    pub fn clean_opt(raw: Option<&str>) -> Option<String> {
        raw.and_then(clean_text)
    }

    /// Make a string safe to embed in a file name.
    pub fn sanitize_filename(name: &str, default: &str) -> String {
        let replaced: String = name
            .chars()
            .map(|c| match c {
                '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_whitespace() => '_',
                c => c,
            })
            .collect();

        let mut collapsed = String::with_capacity(replaced.len());
        for c in replaced.chars() {
            if c == '_' && collapsed.ends_with('_') {
                continue;
            }
            collapsed.push(c);
        }

        let trimmed = collapsed.trim_matches(|c| c == '.' || c == '_');
        if trimmed.is_empty() {
            default.to_string()
        } else {
            trimmed.to_string()
        }
    }
}

/// DOI discovery in free text
pub mod doi {
    use once_cell::sync::Lazy;
    use regex::Regex;

    static DOI_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"\b(10\.\d{4,9}/[^\s<>"']+)"#).expect("DOI pattern is valid")
    });

    /// Return the first DOI-looking token found in any of the inputs, in order.
    pub fn guess_doi<'a, I>(candidates: I) -> Option<String>
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        candidates.into_iter().flatten().find_map(|text| {
            DOI_PATTERN.captures(text).map(|caps| {
                caps[1]
                    .trim_end_matches(|c| matches!(c, ')' | '.' | ',' | ';'))
                    .to_string()
            })
        })
    }
}

/// URL helpers
pub mod links {
    use url::Url;

    /// Host of a URL without a leading `www.`.
    pub fn host_of(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        let host = url.host_str()?;
        Some(host.strip_prefix("www.").unwrap_or(host).to_string())
    }

    /// Resolve a possibly relative link against the document it came from.
    pub fn absolutize(base: &str, link: &str) -> String {
        if Url::parse(link).is_ok() {
            return link.to_string();
        }
        Url::parse(base)
            .and_then(|base| base.join(link))
            .map(|joined| joined.to_string())
            .unwrap_or_else(|_| link.to_string())
    }
}
