use super::engine::{
  extract_asset_urls, extract_links, from_reqwest, proxy_url, CrawlEngine, CrawledPage,
  DownloadedFile, FetchError,
};
use crate::{
  jobs::job::{AssetType, ProxyConfig},
  settings::CrawlerSettings,
};
use async_trait::async_trait;
use futures::StreamExt;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use reqwest::Proxy;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::TracingMiddleware;
use std::{
  collections::HashMap,
  num::NonZeroU32,
  path::{Path, PathBuf},
  time::Duration,
};
use tokio::io::AsyncWriteExt;
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};
use tracing::{instrument, warn};
use url::Url;

const PER_URL_ATTEMPTS: usize = 3;

/// Static-HTML crawl engine: plain HTTP fetches parsed with `tl`. Per-host
/// politeness is enforced here with a keyed rate limiter; per-URL transient
/// failures retry with exponential backoff.
pub struct HtmlParserEngine {
  client: ClientWithMiddleware,
  settings: CrawlerSettings,
  rate_limiter: DefaultKeyedRateLimiter<String>,
}

fn map_middleware_error(error: reqwest_middleware::Error) -> FetchError {
  match error {
    reqwest_middleware::Error::Reqwest(e) => from_reqwest(e),
    reqwest_middleware::Error::Middleware(e) => FetchError::Other(e.to_string()),
  }
}

impl HtmlParserEngine {
  pub fn new(settings: CrawlerSettings, proxy: Option<ProxyConfig>) -> Result<Self, FetchError> {
    let mut base_client_builder = reqwest::ClientBuilder::new()
      .user_agent(settings.user_agent.clone())
      .timeout(Duration::from_secs(settings.download_timeout_seconds as u64));
    if let Some(proxy) = &proxy {
      base_client_builder = base_client_builder
        .proxy(Proxy::all(proxy_url(proxy)).map_err(|e| FetchError::Proxy(e.to_string()))?);
    }
    let base_client = base_client_builder
      .build()
      .map_err(|e| FetchError::Other(e.to_string()))?;
    let client = ClientBuilder::new(base_client)
      .with(TracingMiddleware::default())
      .build();

    let rate = NonZeroU32::new(settings.rate_limit_per_second.max(1))
      .expect("rate is forced to at least 1");
    Ok(Self {
      client,
      settings,
      rate_limiter: RateLimiter::keyed(Quota::per_second(rate)),
    })
  }

  async fn throttle(&self, url: &Url) {
    if let Some(host) = url.host_str() {
      self.rate_limiter.until_key_ready(&host.to_string()).await;
    }
  }

  #[instrument(skip(self))]
  async fn fetch(&self, url: &Url) -> Result<reqwest::Response, FetchError> {
    self.throttle(url).await;
    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(map_middleware_error)?;
    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::Status(status.as_u16()));
    }
    Ok(response)
  }

  /// Doubling backoff starting at `retry_delay_base_seconds`.
  fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
      .factor(self.settings.retry_delay_base_seconds.max(1) as u64 * 500)
      .take(PER_URL_ATTEMPTS - 1)
  }

  async fn download_once(&self, url: &Url, dest: &Path) -> Result<DownloadedFile, FetchError> {
    let response = self.fetch(url).await?;
    let mime_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|value| value.to_str().ok())
      .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());

    let mut file = tokio::fs::File::create(dest)
      .await
      .map_err(|e| FetchError::Other(format!("creating {}: {}", dest.display(), e)))?;
    let mut size_bytes = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
      let chunk = chunk.map_err(from_reqwest)?;
      size_bytes += chunk.len() as u64;
      file
        .write_all(&chunk)
        .await
        .map_err(|e| FetchError::Other(format!("writing {}: {}", dest.display(), e)))?;
    }
    file
      .flush()
      .await
      .map_err(|e| FetchError::Other(e.to_string()))?;

    Ok(DownloadedFile {
      path: dest.to_path_buf(),
      size_bytes,
      mime_type,
    })
  }
}

pub fn file_name_for(url: &Url) -> String {
  let name = url
    .path_segments()
    .and_then(|segments| segments.filter(|segment| !segment.is_empty()).last())
    .unwrap_or("index.html");
  let name = sanitize_filename::sanitize(name);
  if name.is_empty() {
    "index.html".to_string()
  } else {
    name
  }
}

#[async_trait]
impl CrawlEngine for HtmlParserEngine {
  async fn crawl_page(
    &self,
    url: &Url,
    file_extensions: &[String],
  ) -> Result<CrawledPage, FetchError> {
    let response = self.fetch(url).await?;
    let html = response.text().await.map_err(from_reqwest)?;
    let links = extract_links(&html, url, file_extensions);
    Ok(CrawledPage { html, links })
  }

  async fn download(&self, url: &Url, dest: &Path) -> Result<DownloadedFile, FetchError> {
    RetryIf::spawn(
      self.retry_strategy(),
      || self.download_once(url, dest),
      |error: &FetchError| error.is_transient(),
    )
    .await
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
    let mut results: HashMap<AssetType, Vec<PathBuf>> = HashMap::new();
    for (asset_type, urls) in assets {
      let type_dir = dest_dir.join(asset_type.to_string());
      tokio::fs::create_dir_all(&type_dir)
        .await
        .map_err(|e| FetchError::Other(e.to_string()))?;

      let downloads = futures::stream::iter(urls.clone())
        .map(|url: Url| {
          let dest = type_dir.join(file_name_for(&url));
          async move { (url.clone(), self.download(&url, &dest).await) }
        })
        .buffer_unordered(self.settings.max_concurrent_assets.max(1) as usize)
        .collect::<Vec<_>>()
        .await;

      let mut paths = Vec::new();
      for (url, result) in downloads {
        match result {
          Ok(file) => paths.push(file.path),
          Err(e) => warn!(
            message = e.to_string(),
            url = url.to_string().as_str(),
            "Asset download failed"
          ),
        }
      }
      results.insert(*asset_type, paths);
    }
    Ok(results)
  }

  async fn close(&self) -> Result<(), FetchError> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_file_name_for() {
    let url = Url::parse("https://example.com/docs/report.pdf?v=2").unwrap();
    assert_eq!(file_name_for(&url), "report.pdf");

    let url = Url::parse("https://example.com/").unwrap();
    assert_eq!(file_name_for(&url), "index.html");
  }
}
