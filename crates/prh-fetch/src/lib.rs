//! Two-tier page retrieval: a cookie-carrying HTTP session with bounded retry,
//! and a browser fallback used only when bot protection is detected.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use prh_core::{FetchOutcome, FetchTier};
use rand::Rng;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

pub const CRATE_NAME: &str = "prh-fetch";

/// Statuses the session retries transparently.
pub const RETRYABLE_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "en-GB,en-US;q=0.9,en;q=0.8";

pub const DEFAULT_BOT_SIGNALS: [&str; 4] = [
    "JavaScript is disabled",
    "detected unusual traffic",
    "verify you are a human",
    "complete the CAPTCHA",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if RETRYABLE_STATUSES.contains(&status.as_u16()) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_retries: usize, backoff_factor: Duration) -> Self {
        Self {
            max_retries,
            base_delay: backoff_factor,
            ..Default::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub accept_language: String,
    pub referer: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
            referer: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempts")]
    RetriesExhausted {
        url: String,
        status: u16,
        attempts: usize,
    },
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
}

impl TransportError {
    /// Body of a non-retryable error response, if one was read.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Cookie exported from the browser tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
}

impl BrowserCookie {
    pub fn set_cookie_header(&self) -> String {
        let mut header = format!(
            "{}={}; Domain={}; Path={}",
            self.name,
            self.value,
            self.domain,
            self.path_or_root()
        );
        if self.secure {
            header.push_str("; Secure");
        }
        header
    }

    /// URL the cookie is stored against in the session jar.
    pub fn scope_url(&self) -> Option<Url> {
        let host = self.domain.trim_start_matches('.');
        if host.is_empty() {
            return None;
        }
        Url::parse(&format!("https://{host}{}", self.path_or_root())).ok()
    }

    fn path_or_root(&self) -> &str {
        if self.path.is_empty() {
            "/"
        } else {
            &self.path
        }
    }
}

/// Plain HTTP tier of the fetch pipeline.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError>;

    /// Merge browser cookies into the session; returns how many were accepted.
    fn import_cookies(&self, cookies: &[BrowserCookie]) -> usize;
}

/// reqwest-backed session with a persistent cookie jar.
#[derive(Debug)]
pub struct HttpSession {
    client: reqwest::Client,
    jar: Arc<Jar>,
    backoff: BackoffPolicy,
}

impl HttpSession {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(browser_headers(&config)?)
            .cookie_provider(Arc::clone(&jar))
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            jar,
            backoff: config.backoff,
        })
    }

    /// `Cookie` header the session would send to `url`.
    pub fn cookie_header(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        self.jar
            .cookies(&url)
            .and_then(|value| value.to_str().ok().map(ToString::to_string))
    }

    async fn get_with_retry(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let mut attempt = 0usize;
        loop {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|source| TransportError::Network {
                    url: url.to_string(),
                    source,
                })?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if status.is_success() {
                let body = resp.text().await.map_err(|source| TransportError::Network {
                    url: final_url.clone(),
                    source,
                })?;
                debug!(status = status.as_u16(), attempt, bytes = body.len(), "plain fetch ok");
                return Ok(TransportResponse {
                    status: status.as_u16(),
                    final_url,
                    body,
                });
            }

            if classify_status(status) == RetryDisposition::Retryable {
                if attempt < self.backoff.max_retries {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        status = status.as_u16(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retryable status, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(TransportError::RetriesExhausted {
                    url: final_url,
                    status: status.as_u16(),
                    attempts: attempt + 1,
                });
            }

            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body,
            });
        }
    }
}

#[async_trait]
impl Transport for HttpSession {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let span = tracing::info_span!("http_get", url);
        self.get_with_retry(url).instrument(span).await
    }

    fn import_cookies(&self, cookies: &[BrowserCookie]) -> usize {
        let mut imported = 0;
        for cookie in cookies {
            let Some(scope) = cookie.scope_url() else {
                debug!(name = %cookie.name, "skipping cookie without domain");
                continue;
            };
            self.jar.add_cookie_str(&cookie.set_cookie_header(), &scope);
            imported += 1;
        }
        imported
    }
}

fn browser_headers(config: &HttpClientConfig) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_str(&config.accept_language).context("invalid accept-language")?,
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    headers.insert(header::DNT, HeaderValue::from_static("1"));
    headers.insert(header::UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    headers.insert(HeaderName::from_static("sec-fetch-dest"), HeaderValue::from_static("document"));
    headers.insert(HeaderName::from_static("sec-fetch-mode"), HeaderValue::from_static("navigate"));
    headers.insert(HeaderName::from_static("sec-fetch-site"), HeaderValue::from_static("none"));
    headers.insert(HeaderName::from_static("sec-fetch-user"), HeaderValue::from_static("?1"));
    if let Some(referer) = &config.referer {
        headers.insert(
            header::REFERER,
            HeaderValue::from_str(referer).context("invalid referer")?,
        );
    }
    Ok(headers)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    Launch,
    Navigation,
    Settle,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("{stage:?} timed out after {after:?} for {url}")]
    Timeout {
        stage: RenderStage,
        url: String,
        after: Duration,
    },
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("browser protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub html: String,
    pub cookies: Vec<BrowserCookie>,
}

/// Browser tier. One instance lives for a whole pipeline run.
#[async_trait]
pub trait Renderer: Send {
    async fn render(&mut self, url: &str) -> Result<RenderedPage, RenderError>;

    /// Release the browser. Safe to call more than once.
    async fn close(&mut self) -> Result<(), RenderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceStage {
    BeforePlainFetch,
    BeforeRender,
}

/// Delay policy between requests.
#[async_trait]
pub trait Pacing: Send + Sync {
    async fn pause(&self, stage: PaceStage);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoPacing;

#[async_trait]
impl Pacing for NoPacing {
    async fn pause(&self, _stage: PaceStage) {}
}

/// Uniform random delay in `[min, max]`.
#[derive(Debug, Clone, Copy)]
pub struct RandomPacing {
    pub min: Duration,
    pub max: Duration,
}

impl RandomPacing {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }
}

#[async_trait]
impl Pacing for RandomPacing {
    async fn pause(&self, stage: PaceStage) {
        let delay = self.sample();
        debug!(?stage, delay_ms = delay.as_millis() as u64, "pacing");
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone)]
pub struct BotSignals {
    needles: Vec<String>,
}

impl Default for BotSignals {
    fn default() -> Self {
        Self::new(DEFAULT_BOT_SIGNALS)
    }
}

impl BotSignals {
    pub fn new<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            needles: needles.into_iter().map(Into::into).collect(),
        }
    }

    /// First signal found in `body`, matched case-sensitively.
    pub fn detect(&self, body: &str) -> Option<&str> {
        self.needles
            .iter()
            .find(|needle| body.contains(needle.as_str()))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub plain_fetches: usize,
    pub renders: usize,
    pub cookies_imported: usize,
    pub blocked: usize,
    pub failures: usize,
}

#[derive(Debug)]
enum FetchState {
    PlainFetch,
    BotCheck { signal: String },
    BrowserRender,
    Done(FetchOutcome),
}

/// Single `fetch(url)` entry point over both tiers.
pub struct AdaptiveFetcher {
    transport: Box<dyn Transport>,
    renderer: Box<dyn Renderer>,
    pacing: Box<dyn Pacing>,
    signals: BotSignals,
    stats: FetchStats,
}

impl AdaptiveFetcher {
    pub fn new(transport: Box<dyn Transport>, renderer: Box<dyn Renderer>) -> Self {
        Self {
            transport,
            renderer,
            pacing: Box::new(NoPacing),
            signals: BotSignals::default(),
            stats: FetchStats::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: Box<dyn Pacing>) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_bot_signals(mut self, signals: BotSignals) -> Self {
        self.signals = signals;
        self
    }

    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    pub async fn fetch(&mut self, url: &str) -> FetchOutcome {
        let span = tracing::info_span!("adaptive_fetch", url);
        let outcome = self.drive(url).instrument(span).await;
        match outcome.status {
            prh_core::FetchStatus::Success => {}
            prh_core::FetchStatus::Blocked => self.stats.blocked += 1,
            prh_core::FetchStatus::TransientFailure => self.stats.failures += 1,
        }
        outcome
    }

    async fn drive(&mut self, url: &str) -> FetchOutcome {
        let mut state = FetchState::PlainFetch;
        loop {
            state = match state {
                FetchState::PlainFetch => self.plain_fetch(url).await,
                FetchState::BotCheck { signal } => {
                    warn!(%signal, "bot protection detected, switching to browser");
                    FetchState::BrowserRender
                }
                FetchState::BrowserRender => self.browser_render(url).await,
                FetchState::Done(outcome) => return outcome,
            };
        }
    }

    async fn plain_fetch(&mut self, url: &str) -> FetchState {
        self.pacing.pause(PaceStage::BeforePlainFetch).await;
        self.stats.plain_fetches += 1;

        let body = match self.transport.get(url).await {
            Ok(resp) => resp.body,
            Err(err) => {
                // A bot wall served with an error status still goes to the browser.
                if let Some(signal) = err.body().and_then(|b| self.signals.detect(b)) {
                    return FetchState::BotCheck {
                        signal: signal.to_string(),
                    };
                }
                warn!(error = %err, "plain fetch failed");
                return FetchState::Done(FetchOutcome::transient_failure(FetchTier::Plain));
            }
        };

        match self.signals.detect(&body) {
            Some(signal) => FetchState::BotCheck {
                signal: signal.to_string(),
            },
            None => FetchState::Done(FetchOutcome::success(body, FetchTier::Plain)),
        }
    }

    async fn browser_render(&mut self, url: &str) -> FetchState {
        self.pacing.pause(PaceStage::BeforeRender).await;
        self.stats.renders += 1;

        let page = match self.renderer.render(url).await {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, "browser render failed");
                return FetchState::Done(FetchOutcome::blocked());
            }
        };

        if let Some(signal) = self.signals.detect(&page.html) {
            warn!(%signal, "still blocked after browser render");
            return FetchState::Done(FetchOutcome::blocked());
        }

        let imported = self.transport.import_cookies(&page.cookies);
        self.stats.cookies_imported += imported;
        info!(cookies = imported, "browser render succeeded, session cookies refreshed");
        FetchState::Done(FetchOutcome::success(page.html, FetchTier::Rendered))
    }

    /// Close the browser tier. Callers run this on every exit path of a run.
    pub async fn shutdown(&mut self) {
        if let Err(err) = self.renderer.close().await {
            warn!(error = %err, "closing browser failed");
        }
    }
}
