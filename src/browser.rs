//! Render capability backed by headless Chromium
//!
//! The pool only sees the [`BrowserLauncher`] and [`RenderHandle`] traits.
//! [`ChromiumLauncher`] starts real browser processes through chromiumoxide;
//! every render opens a fresh page on the handle and closes it afterwards,
//! so several jobs may share one handle.

use crate::{create_browser_config, Config, OutputKind, RenderError, RenderRequest, RenderTarget};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, PrintToPdfParams};
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

/// A launched, render-capable browser instance.
#[async_trait]
pub trait RenderHandle: Send + Sync {
    /// Render `request` and return the produced bytes. The whole call,
    /// page setup included, must finish within `timeout`.
    async fn render(&self, request: &RenderRequest, timeout: Duration)
        -> Result<Vec<u8>, RenderError>;

    /// Shut the instance down.
    async fn close(&self) -> Result<(), RenderError>;
}

/// Starts render handles for pool slots.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, slot: usize) -> Result<Arc<dyn RenderHandle>, RenderError>;
}

/// Interval between selector lookups while waiting for an element.
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs against the matched element. Hidden elements and elements without
/// a box do not count as present.
const VISIBILITY_CHECK: &str = "function() {
    const style = window.getComputedStyle(this);
    const rect = this.getBoundingClientRect();
    return style.visibility !== 'hidden' && rect.width > 0 && rect.height > 0;
}";

/// A4 paper size in inches.
const A4_WIDTH_IN: f64 = 8.27;
const A4_HEIGHT_IN: f64 = 11.69;

pub struct ChromiumLauncher {
    config: Config,
}

impl ChromiumLauncher {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, slot: usize) -> Result<Arc<dyn RenderHandle>, RenderError> {
        let browser_config = create_browser_config(&self.config, slot)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| RenderError::PoolLaunchFailure(e.to_string()))?;

        // The handler drives the DevTools connection and must be polled for
        // as long as the browser lives.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Chromium handler for slot {} ended: {}", slot, e);
                    break;
                }
            }
        });

        info!("Chromium instance for slot {} launched", slot);
        Ok(Arc::new(ChromiumHandle {
            slot,
            browser: Mutex::new(browser),
            handler: handler_task,
        }))
    }
}

pub struct ChromiumHandle {
    slot: usize,
    browser: Mutex<Browser>,
    handler: tokio::task::JoinHandle<()>,
}

impl ChromiumHandle {
    async fn new_page(&self) -> Result<Page, RenderError> {
        let browser = self.browser.lock().await;
        browser
            .new_page("about:blank")
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))
    }

    async fn capture(
        &self,
        page: &Page,
        request: &RenderRequest,
        deadline: Instant,
    ) -> Result<Vec<u8>, RenderError> {
        match request.target() {
            Some(RenderTarget::Url(url)) => {
                debug!("goto page start ------ {}", url);
                page.goto(url)
                    .await
                    .map_err(|e| RenderError::Navigation(e.to_string()))?;
                debug!("goto page end ------ {}", url);
            }
            Some(RenderTarget::Html(html)) => {
                debug!("start render html, {} bytes", html.len());
                page.set_content(html)
                    .await
                    .map_err(|e| RenderError::Navigation(e.to_string()))?;
            }
            None => {
                return Err(RenderError::Validation(
                    "either url or html must be provided".to_string(),
                ))
            }
        }

        let element = match request.selector() {
            Some(selector) => {
                let wait = deadline.saturating_duration_since(Instant::now()) / 2;
                Some(wait_for_visible(page, selector, wait).await?)
            }
            None => None,
        };

        match (request.output, element) {
            (OutputKind::Pdf, _) => {
                let params = PrintToPdfParams {
                    print_background: Some(true),
                    paper_width: Some(A4_WIDTH_IN),
                    paper_height: Some(A4_HEIGHT_IN),
                    ..Default::default()
                };
                page.pdf(params)
                    .await
                    .map_err(|e| RenderError::Capture(e.to_string()))
            }
            // TODO: element captures keep the page background until chromiumoxide
            // exposes omit_background on Element::screenshot.
            (OutputKind::Image, Some(element)) => element
                .screenshot(CaptureScreenshotFormat::Png)
                .await
                .map_err(|e| RenderError::Capture(e.to_string())),
            (OutputKind::Image, None) => {
                let params = ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(true)
                    .omit_background(true)
                    .build();
                page.screenshot(params)
                    .await
                    .map_err(|e| RenderError::Capture(e.to_string()))
            }
        }
    }
}

/// Wait until `selector` matches an element that is rendered and visible.
async fn wait_for_visible(
    page: &Page,
    selector: &str,
    wait: Duration,
) -> Result<Element, RenderError> {
    poll_until(wait, SELECTOR_POLL_INTERVAL, move || async move {
        let element = page.find_element(selector).await.ok()?;
        is_visible(&element).await.then_some(element)
    })
    .await
    .ok_or_else(|| RenderError::SelectorNotFound(selector.to_string()))
}

async fn is_visible(element: &Element) -> bool {
    match element.call_js_fn(VISIBILITY_CHECK, false).await {
        Ok(returns) => reported_visible(returns.result.value.as_ref()),
        Err(e) => {
            debug!("visibility check failed: {}", e);
            false
        }
    }
}

fn reported_visible(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Bool(true)))
}

/// Run `probe` every `every` until it yields a value or `wait` has passed.
/// The probe always runs at least once.
async fn poll_until<T, F, Fut>(wait: Duration, every: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let started = Instant::now();
    loop {
        if let Some(found) = probe().await {
            return Some(found);
        }
        if started.elapsed() >= wait {
            return None;
        }
        sleep(every).await;
    }
}

/// Closes its page on drop, so a render cancelled from outside still
/// releases the tab.
struct PageGuard {
    page: Option<Page>,
    slot: usize,
}

impl PageGuard {
    fn new(page: &Page, slot: usize) -> Self {
        Self {
            page: Some(page.clone()),
            slot,
        }
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take() {
            close_page(page, self.slot).await;
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        let slot = self.slot;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(close_page(page, slot));
        }
    }
}

async fn close_page(page: Page, slot: usize) {
    if let Err(e) = page.close().await {
        warn!("Failed to close page on slot {}: {}", slot, e);
    }
}

#[async_trait]
impl RenderHandle for ChromiumHandle {
    async fn render(
        &self,
        request: &RenderRequest,
        budget: Duration,
    ) -> Result<Vec<u8>, RenderError> {
        let deadline = Instant::now() + budget;

        let page = timeout_at(deadline, self.new_page())
            .await
            .map_err(|_| RenderError::Timeout(budget))??;
        let guard = PageGuard::new(&page, self.slot);

        let result = timeout_at(deadline, self.capture(&page, request, deadline))
            .await
            .unwrap_or(Err(RenderError::Timeout(budget)));

        guard.close().await;
        result
    }

    async fn close(&self) -> Result<(), RenderError> {
        let result = self
            .browser
            .lock()
            .await
            .close()
            .await
            .map(|_| ())
            .map_err(|e| RenderError::Io(e.to_string()));
        self.handler.abort();
        result
    }
}
