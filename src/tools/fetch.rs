//! Outbound HTTP shared by the web tools, and the `web_fetch` tool.
//!
//! [`WebClient`] enforces the URL policy (scheme, HTTPS-only, domain
//! allowlist) on the requested URL and on every redirect hop, and keeps an
//! LRU cache of responses with a per-entry TTL.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lru::LruCache;
use serde_json::json;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use super::{ParamSpec, ParamType, RiskLevel, Tool, ToolArgs, ToolContext, ToolResult};
use crate::config::WebConfig;

/// A fetched response body, decoded lossily as UTF-8.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub content_type: String,
    pub body: String,
    pub truncated: bool,
}

/// LRU of responses that expire `ttl` after insertion.
pub struct ResponseCache {
    entries: LruCache<String, (Instant, FetchedPage)>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            ttl,
        }
    }

    pub fn get(&mut self, key: &str, now: Instant) -> Option<FetchedPage> {
        let fresh = match self.entries.get(key) {
            Some((at, page)) if now.duration_since(*at) < self.ttl => Some(page.clone()),
            Some(_) => None,
            None => return None,
        };
        if fresh.is_none() {
            self.entries.pop(key);
        }
        fresh
    }

    pub fn insert(&mut self, key: String, page: FetchedPage, now: Instant) {
        self.entries.put(key, (now, page));
    }

    pub fn reconfigure(&mut self, capacity: usize, ttl: Duration) {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        self.entries.resize(cap);
        self.ttl = ttl;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 5;

fn check_scheme(settings: &WebConfig, url: &Url) -> Result<()> {
    match url.scheme() {
        "https" => Ok(()),
        "http" if !settings.https_only => Ok(()),
        "http" => bail!("only https URLs are allowed: {}", url),
        other => bail!("unsupported URL scheme: {}", other),
    }
}

fn host_of(url: &Url) -> Result<String> {
    Ok(url
        .host_str()
        .ok_or_else(|| anyhow!("URL has no host: {}", url))?
        .to_lowercase())
}

/// Check a parsed URL against the scheme rules and the domain allowlist.
pub fn check_allowed(settings: &WebConfig, url: &Url) -> Result<()> {
    check_scheme(settings, url)?;
    let host = host_of(url)?;
    if !settings.allow_all {
        let allowed = settings.allowlist.iter().any(|domain| {
            let domain = domain.trim().trim_start_matches("*.").to_lowercase();
            !domain.is_empty() && (host == domain || host.ends_with(&format!(".{}", domain)))
        });
        if !allowed {
            bail!("domain not in allowlist: {}", host);
        }
    }
    Ok(())
}

/// Validate a URL against the web policy.
pub fn check_url_policy(settings: &WebConfig, raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid URL: {}", raw))?;
    check_allowed(settings, &url)?;
    Ok(url)
}

/// The search endpoint skips the allowlist but keeps the scheme rules, and
/// every hop must stay on the endpoint's host.
pub fn check_endpoint_policy(settings: &WebConfig, url: &Url) -> Result<()> {
    check_scheme(settings, url)?;
    let endpoint = Url::parse(&settings.search_endpoint)
        .with_context(|| format!("invalid search endpoint: {}", settings.search_endpoint))?;
    let host = host_of(url)?;
    if host != host_of(&endpoint)? {
        bail!("search request left the endpoint host: {}", host);
    }
    Ok(())
}

pub struct WebClient {
    http: reqwest::Client,
    settings: RwLock<WebConfig>,
    cache: Mutex<ResponseCache>,
}

impl WebClient {
    pub fn new(settings: WebConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("vault-assist/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let cache = ResponseCache::new(
            settings.cache_capacity,
            Duration::from_secs(settings.cache_ttl_secs),
        );
        Ok(Self {
            http,
            settings: RwLock::new(settings),
            cache: Mutex::new(cache),
        })
    }

    pub fn settings(&self) -> WebConfig {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Apply new web settings; cached entries survive.
    pub fn update_settings(&self, settings: WebConfig) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reconfigure(
                settings.cache_capacity,
                Duration::from_secs(settings.cache_ttl_secs),
            );
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    pub fn check_url(&self, raw: &str) -> Result<Url> {
        check_url_policy(&self.settings(), raw)
    }

    /// GET an allowlisted URL through the cache.
    pub async fn fetch(&self, url: &Url, max_bytes: usize) -> Result<FetchedPage> {
        self.get(url, max_bytes, check_allowed).await
    }

    /// GET a URL on the configured search endpoint through the cache.
    pub async fn fetch_endpoint(&self, url: &Url, max_bytes: usize) -> Result<FetchedPage> {
        self.get(url, max_bytes, check_endpoint_policy).await
    }

    /// GET through the cache, applying `allowed` to the URL and every
    /// redirect target before it is requested.
    async fn get<F>(&self, url: &Url, max_bytes: usize, allowed: F) -> Result<FetchedPage>
    where
        F: Fn(&WebConfig, &Url) -> Result<()> + Send + Sync,
    {
        let settings = self.settings();
        let key = url.as_str().to_string();
        if settings.cache_enabled {
            let hit = self
                .cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&key, Instant::now());
            if let Some(page) = hit {
                tracing::debug!(url = %key, "web cache hit");
                return Ok(page);
            }
        }

        let mut current = url.clone();
        let mut hops = 0;
        let response = loop {
            allowed(&settings, &current)?;
            let response = self
                .http
                .get(current.clone())
                .send()
                .await
                .with_context(|| format!("request failed: {}", current))?;
            if !response.status().is_redirection() {
                break response;
            }
            if hops == MAX_REDIRECTS {
                bail!("too many redirects: {}", url);
            }
            hops += 1;
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| anyhow!("redirect without Location from {}", current))?;
            let next = current
                .join(location)
                .with_context(|| format!("invalid redirect target: {}", location))?;
            tracing::debug!(from = %current, to = %next, "following redirect");
            current = next;
        };

        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} for {}", status, current);
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut bytes = Vec::new();
        let mut truncated = false;
        let mut body = Box::pin(response.bytes_stream());
        while let Some(chunk) = body.next().await {
            let chunk = chunk.with_context(|| format!("failed reading body of {}", current))?;
            let room = max_bytes - bytes.len();
            if chunk.len() > room {
                bytes.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        let page = FetchedPage {
            url: current.to_string(),
            status: status.as_u16(),
            content_type,
            body: String::from_utf8_lossy(&bytes).into_owned(),
            truncated,
        };
        if settings.cache_enabled {
            self.cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key, page.clone(), Instant::now());
        }
        Ok(page)
    }
}

/// Convert an HTML body to Markdown or plain text.
pub fn normalize_html(body: &str, format: &str) -> String {
    match format {
        "text" => html2text::from_read(body.as_bytes(), 80),
        _ => html2md::parse_html(body),
    }
}

fn truncate_to(mut text: String, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    (text, true)
}

pub struct WebFetchTool {
    client: Arc<WebClient>,
}

impl WebFetchTool {
    pub fn new(client: Arc<WebClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a web page and return it as Markdown or plain text. Only allowlisted domains are reachable."
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("url", ParamType::String, "Absolute URL to fetch"),
            ParamSpec::optional("format", ParamType::String, "'markdown' or 'text'")
                .with_default(json!("markdown")),
        ]
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    fn is_network(&self) -> bool {
        true
    }

    async fn execute(&self, args: &ToolArgs, _ctx: &ToolContext) -> Result<ToolResult> {
        let url = self.client.check_url(args.require_str("url")?)?;
        let format = match args.str("format") {
            Some("text") => "text",
            _ => "markdown",
        };
        let max_bytes = self.client.settings().fetch_max_bytes;
        let page = self.client.fetch(&url, max_bytes).await?;

        let content = if page.content_type.contains("html") {
            normalize_html(&page.body, format)
        } else {
            page.body.clone()
        };
        let (content, cut) = truncate_to(content, max_bytes);

        Ok(ToolResult::ok(json!({
            "url": page.url,
            "status": page.status,
            "content_type": page.content_type,
            "format": format,
            "content": content,
            "truncated": cut || page.truncated,
        })))
    }
}
