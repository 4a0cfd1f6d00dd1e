#![allow(dead_code)]

use async_trait::async_trait;
use rss_digest::traits::{FeedSource, PageEnricher, Translator};
use rss_digest::{
    ArticleCandidate, DigestError, EnrichedArticle, FeedCacheHeader, FeedFetch, FetchedFeed,
    Result,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// Minimal HTTP/1.1 responder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StubResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

type Handler = dyn Fn(&RecordedRequest) -> StubResponse + Send + Sync;

/// Serves every connection with `handler` and records each request.
pub struct StubServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> StubResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, handler, recorded).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve(
    mut stream: TcpStream,
    handler: Arc<Handler>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let request = RecordedRequest {
        method,
        path,
        headers,
        body,
    };
    let response = handler(&request);
    recorded.lock().unwrap().push(request);

    let mut out = format!("HTTP/1.1 {} Stub\r\n", response.status);
    for (name, value) in &response.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        response.body.len()
    ));
    stream.write_all(out.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await?;
    Ok(())
}

/// Accepts connections and never answers, so clients run into their timeout.
pub async fn silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

// ---------------------------------------------------------------------------
// Collaborator stubs
// ---------------------------------------------------------------------------

pub enum CannedFeed {
    Body(String),
    BodyWithEtag(String, String),
    NotModified,
    Fail(String),
}

/// Feed source answering from a fixed table, recording the validators it was given.
pub struct CannedFeeds {
    feeds: HashMap<String, CannedFeed>,
    calls: Mutex<Vec<(String, Option<FeedCacheHeader>)>>,
}

impl CannedFeeds {
    pub fn new() -> Self {
        Self {
            feeds: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, url: &str, feed: CannedFeed) -> Self {
        self.feeds.insert(url.to_string(), feed);
        self
    }

    pub fn calls(&self) -> Vec<(String, Option<FeedCacheHeader>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedSource for CannedFeeds {
    async fn fetch_feed(&self, url: &str, cache: Option<&FeedCacheHeader>) -> Result<FeedFetch> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), cache.cloned()));

        let fetched = |body: &str, etag: Option<&str>| {
            FeedFetch::Fetched(FetchedFeed {
                body: body.as_bytes().to_vec(),
                etag: etag.map(str::to_string),
                last_modified: None,
                http_status: 200,
            })
        };

        match self.feeds.get(url) {
            Some(CannedFeed::Body(body)) => Ok(fetched(body, None)),
            Some(CannedFeed::BodyWithEtag(body, etag)) => Ok(fetched(body, Some(etag))),
            Some(CannedFeed::NotModified) => Ok(FeedFetch::NotModified),
            Some(CannedFeed::Fail(reason)) => Err(DigestError::FeedFetch {
                url: url.to_string(),
                reason: reason.clone(),
            }),
            None => Err(DigestError::FeedFetch {
                url: url.to_string(),
                reason: "HTTP 404 Not Found".to_string(),
            }),
        }
    }
}

/// Enricher that never touches the network and adds a fixed abstract.
pub struct FeedOnlyEnricher {
    pub calls: AtomicUsize,
}

impl FeedOnlyEnricher {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageEnricher for FeedOnlyEnricher {
    async fn enrich(&self, candidate: ArticleCandidate) -> EnrichedArticle {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut article = EnrichedArticle::from_candidate(candidate);
        article.abstract_en = Some(format!("Abstract of {}", article.title_en));
        article
    }
}

/// Prefixes text with `[zh]`, failing for any text containing "untranslatable".
pub struct PrefixTranslator;

#[async_trait]
impl Translator for PrefixTranslator {
    fn name(&self) -> &str {
        "prefix"
    }

    async fn translate(&self, text: &str, _target_language: &str) -> Result<String> {
        if text.contains("untranslatable") {
            return Err(DigestError::Translation("HTTP 500 Internal Server Error".to_string()));
        }
        Ok(format!("[zh] {text}"))
    }
}
