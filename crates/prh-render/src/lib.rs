//! Headless Chromium implementation of the browser tier.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetLocaleOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Page;
use futures::StreamExt;
use prh_fetch::{
    BrowserCookie, RenderError, RenderStage, RenderedPage, Renderer, DEFAULT_ACCEPT_LANGUAGE,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "prh-render";

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub chrome_executable: Option<PathBuf>,
    pub user_agent: String,
    pub accept_language: String,
    pub locale: String,
    pub timezone: String,
    pub viewport: (u32, u32),
    pub navigation_timeout: Duration,
    pub settle_timeout: Duration,
    /// Idle time after `readyState == "complete"` for challenge scripts to finish.
    pub settle_quiet: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            chrome_executable: None,
            user_agent: BROWSER_USER_AGENT.to_string(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
            locale: "en-GB".to_string(),
            timezone: "Europe/London".to_string(),
            viewport: (1366, 768),
            navigation_timeout: Duration::from_secs(60),
            settle_timeout: Duration::from_secs(15),
            settle_quiet: Duration::from_millis(1500),
        }
    }
}

impl RenderConfig {
    pub fn launch_args(&self) -> Vec<String> {
        vec![
            "--disable-setuid-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-gpu".to_string(),
            "--no-zygote".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            format!("--lang={}", self.locale),
        ]
    }

    fn browser_config(&self) -> Result<BrowserConfig, RenderError> {
        let (width, height) = self.viewport;
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(width, height)
            .viewport(Viewport {
                width,
                height,
                ..Default::default()
            })
            .request_timeout(self.navigation_timeout)
            .args(self.launch_args());
        if let Some(path) = &self.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        builder.build().map_err(RenderError::Launch)
    }
}

struct BrowserSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

/// Browser launched on first use and kept for the rest of the run.
pub struct ChromeRenderer {
    config: RenderConfig,
    session: Option<BrowserSession>,
}

impl ChromeRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub fn is_launched(&self) -> bool {
        self.session.is_some()
    }

    async fn launch(&self) -> Result<BrowserSession, RenderError> {
        let (browser, mut handler) = Browser::launch(self.config.browser_config()?)
            .await
            .map_err(|err| RenderError::Launch(err.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser handler stopped");
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|err| RenderError::Launch(err.to_string()))?;
        let session = BrowserSession {
            browser,
            page,
            handler,
        };
        self.harden(&session.page).await?;
        info!(
            user_agent = %self.config.user_agent,
            timezone = %self.config.timezone,
            "browser launched"
        );
        Ok(session)
    }

    /// Fingerprint mitigations, applied once per page.
    async fn harden(&self, page: &Page) -> Result<(), RenderError> {
        let protocol = |err: chromiumoxide::error::CdpError| RenderError::Protocol(err.to_string());

        page.enable_stealth_mode_with_agent(&self.config.user_agent)
            .await
            .map_err(protocol)?;
        page.execute(SetTimezoneOverrideParams::new(self.config.timezone.clone()))
            .await
            .map_err(protocol)?;
        page.execute(SetLocaleOverrideParams {
            locale: Some(self.config.locale.clone()),
        })
        .await
        .map_err(protocol)?;
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(serde_json::json!({
            "Accept-Language": self.config.accept_language,
        }))))
        .await
        .map_err(protocol)?;
        Ok(())
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<(), RenderError> {
        match tokio::time::timeout(self.config.navigation_timeout, page.goto(url)).await {
            Err(_) => Err(RenderError::Timeout {
                stage: RenderStage::Navigation,
                url: url.to_string(),
                after: self.config.navigation_timeout,
            }),
            Ok(Err(err)) => Err(RenderError::Navigation {
                url: url.to_string(),
                message: err.to_string(),
            }),
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn settle(&self, page: &Page, url: &str) -> Result<(), RenderError> {
        let ready_state = || async move {
            page.evaluate("document.readyState")
                .await
                .map_err(|err| err.to_string())?
                .into_value::<String>()
                .map_err(|err| err.to_string())
        };
        let wait = wait_for_ready_state(ready_state, self.config.settle_quiet, READY_POLL_INTERVAL);

        tokio::time::timeout(self.config.settle_timeout, wait)
            .await
            .map_err(|_| RenderError::Timeout {
                stage: RenderStage::Settle,
                url: url.to_string(),
                after: self.config.settle_timeout,
            })
    }
}

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Waits for `readyState == "complete"` twice, each followed by `quiet`, so
/// a challenge page that reloads itself gets a second chance to finish.
/// Probe errors (e.g. the context being torn down by a redirect) count as
/// "not complete yet"; the caller bounds the whole wait.
async fn wait_for_ready_state<F, Fut, E>(mut ready_state: F, quiet: Duration, interval: Duration)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, E>>,
    E: std::fmt::Display,
{
    for _ in 0..2 {
        loop {
            match ready_state().await {
                Ok(state) if state == "complete" => break,
                Ok(state) => debug!(%state, "page still loading"),
                Err(err) => debug!(error = %err, "ready state unavailable, still settling"),
            }
            tokio::time::sleep(interval).await;
        }
        tokio::time::sleep(quiet).await;
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn render(&mut self, url: &str) -> Result<RenderedPage, RenderError> {
        if self.session.is_none() {
            self.session = Some(self.launch().await?);
        }
        let Some(session) = self.session.as_ref() else {
            return Err(RenderError::Launch("browser session missing".to_string()));
        };
        let page = &session.page;

        self.navigate(page, url).await?;
        self.settle(page, url).await?;

        let html = page
            .content()
            .await
            .map_err(|err| RenderError::Protocol(err.to_string()))?;
        let cookies = page
            .get_cookies()
            .await
            .map_err(|err| RenderError::Protocol(err.to_string()))?
            .into_iter()
            .map(|c| BrowserCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                secure: c.secure,
            })
            .collect::<Vec<_>>();

        debug!(bytes = html.len(), cookies = cookies.len(), "page rendered");
        Ok(RenderedPage { html, cookies })
    }

    async fn close(&mut self) -> Result<(), RenderError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let closed = session
            .browser
            .close()
            .await
            .map(|_| ())
            .map_err(|err| RenderError::Protocol(err.to_string()));
        if let Err(err) = session.browser.wait().await {
            warn!(error = %err, "waiting for browser exit failed");
        }
        let _ = (&mut session.handler).await;
        info!("browser closed");
        closed
    }
}
