use super::{
  engine::{
    extract_asset_urls, extract_links, proxy_url, CrawlEngine, CrawledPage, DownloadedFile,
    FetchError,
  },
  html_parser_engine::HtmlParserEngine,
};
use crate::{
  jobs::job::{AssetType, ProxyConfig},
  settings::CrawlerSettings,
};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  time::Duration,
};
use tokio::{task::JoinHandle, time::timeout};
use tracing::{instrument, warn};
use url::Url;

/// JS-rendering crawl engine on a headless Chromium instance. Page loads go
/// through the browser; raw file and asset downloads are delegated to the
/// HTTP engine, which already carries the politeness and retry behavior.
pub struct HeadlessBrowserEngine {
  browser: tokio::sync::Mutex<Browser>,
  handler_task: JoinHandle<()>,
  downloader: HtmlParserEngine,
  settings: CrawlerSettings,
}

impl HeadlessBrowserEngine {
  pub async fn new(
    settings: CrawlerSettings,
    proxy: Option<ProxyConfig>,
  ) -> Result<Self, FetchError> {
    let mut config_builder = BrowserConfig::builder();
    if let Some(proxy) = &proxy {
      config_builder = config_builder.arg(format!("--proxy-server={}", proxy_url(proxy)));
    }
    let config = config_builder
      .build()
      .map_err(|e| FetchError::Javascript(format!("browser config: {}", e)))?;

    let (browser, mut handler) = Browser::launch(config)
      .await
      .map_err(|e| FetchError::Javascript(format!("browser launch: {}", e)))?;
    let handler_task = tokio::spawn(async move {
      while let Some(event) = handler.next().await {
        if event.is_err() {
          break;
        }
      }
    });

    let downloader = HtmlParserEngine::new(settings.clone(), proxy)?;
    Ok(Self {
      browser: tokio::sync::Mutex::new(browser),
      handler_task,
      downloader,
      settings,
    })
  }

  #[instrument(skip(self))]
  async fn render(&self, url: &Url) -> Result<String, FetchError> {
    let render_timeout = Duration::from_secs(self.settings.headless_timeout_seconds.max(1) as u64);
    let browser = self.browser.lock().await;
    let page = browser
      .new_page(url.as_str())
      .await
      .map_err(|e| FetchError::Javascript(e.to_string()))?;
    let html = timeout(render_timeout, async {
      page
        .wait_for_navigation()
        .await
        .map_err(|e| FetchError::Javascript(e.to_string()))?;
      page
        .content()
        .await
        .map_err(|e| FetchError::Javascript(e.to_string()))
    })
    .await
    .map_err(|_| FetchError::Timeout)??;
    if let Err(e) = page.close().await {
      warn!(message = e.to_string(), "Failed to close browser page");
    }
    Ok(html)
  }
}

#[async_trait]
impl CrawlEngine for HeadlessBrowserEngine {
  async fn crawl_page(
    &self,
    url: &Url,
    file_extensions: &[String],
  ) -> Result<CrawledPage, FetchError> {
    let html = self.render(url).await?;
    let links = extract_links(&html, url, file_extensions);
    Ok(CrawledPage { html, links })
  }

  async fn download(&self, url: &Url, dest: &Path) -> Result<DownloadedFile, FetchError> {
    self.downloader.download(url, dest).await
  }

  fn extract_assets(
    &self,
    html: &str,
    base_url: &Url,
    asset_types: &[AssetType],
  ) -> HashMap<AssetType, Vec<Url>> {
    extract_asset_urls(html, base_url, asset_types)
  }

  async fn download_assets(
    &self,
    assets: &HashMap<AssetType, Vec<Url>>,
    dest_dir: &Path,
  ) -> Result<HashMap<AssetType, Vec<PathBuf>>, FetchError> {
    self.downloader.download_assets(assets, dest_dir).await
  }

  async fn close(&self) -> Result<(), FetchError> {
    let mut browser = self.browser.lock().await;
    if let Err(e) = browser.close().await {
      warn!(message = e.to_string(), "Failed to close browser");
    }
    self.handler_task.abort();
    Ok(())
  }
}
