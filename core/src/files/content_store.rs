use crate::settings::ContentStoreSettings;
use anyhow::Result;
use s3::{creds::Credentials, Bucket};
use std::collections::HashMap;
use strum::Display;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StoreBucket {
  Uploads,
  Pages,
  Results,
  Crawled,
}

/// Blob-store client over the object-storage contract. One `Bucket` handle
/// per logical bucket; keys are append-only per execution.
pub struct ContentStore {
  buckets: HashMap<StoreBucket, Box<Bucket>>,
}

impl ContentStore {
  pub fn new(settings: &ContentStoreSettings) -> Result<Self> {
    let credentials = Credentials::new(
      Some(&settings.key),
      Some(&settings.secret),
      None,
      None,
      None,
    )?;
    let mut buckets = HashMap::new();
    for bucket in [
      StoreBucket::Uploads,
      StoreBucket::Pages,
      StoreBucket::Results,
      StoreBucket::Crawled,
    ] {
      buckets.insert(
        bucket,
        Bucket::new(
          &bucket.to_string(),
          s3::Region::Custom {
            region: settings.region.clone(),
            endpoint: settings.endpoint.clone(),
          },
          credentials.clone(),
        )?,
      );
    }
    Ok(Self { buckets })
  }

  fn bucket(&self, bucket: StoreBucket) -> &Bucket {
    self
      .buckets
      .get(&bucket)
      .expect("all buckets are created in the constructor")
  }

  #[instrument(skip(self, content))]
  pub async fn put(
    &self,
    bucket: StoreBucket,
    key: &str,
    content: &[u8],
    content_type: &str,
  ) -> Result<()> {
    self
      .bucket(bucket)
      .put_object_with_content_type(key, content, content_type)
      .await?;
    Ok(())
  }

  #[instrument(skip(self))]
  pub async fn get(&self, bucket: StoreBucket, key: &str) -> Result<Vec<u8>> {
    let response = self.bucket(bucket).get_object(key).await?;
    Ok(response.bytes().to_vec())
  }

  #[instrument(skip(self))]
  pub async fn presigned_get(
    &self,
    bucket: StoreBucket,
    key: &str,
    ttl_seconds: u32,
  ) -> Result<String> {
    Ok(self.bucket(bucket).presign_get(key, ttl_seconds, None).await?)
  }

  pub async fn delete(&self, bucket: StoreBucket, key: &str) -> Result<()> {
    self.bucket(bucket).delete_object(key).await?;
    Ok(())
  }

  pub async fn list(&self, bucket: StoreBucket, prefix: &str) -> Result<Vec<String>> {
    let results = self
      .bucket(bucket)
      .list(prefix.to_string(), None)
      .await?;
    Ok(
      results
        .into_iter()
        .flat_map(|page| page.contents)
        .map(|object| object.key)
        .collect(),
    )
  }

  #[instrument(skip(self))]
  pub async fn delete_prefix(&self, bucket: StoreBucket, prefix: &str) -> Result<()> {
    for key in self.list(bucket, prefix).await? {
      self.bucket(bucket).delete_object(&key).await?;
    }
    Ok(())
  }

  pub async fn object_size(&self, bucket: StoreBucket, key: &str) -> Result<Option<u64>> {
    let (head, _) = self.bucket(bucket).head_object(key).await?;
    Ok(head.content_length.map(|length| length as u64))
  }
}

/// Key layout under the `crawled` bucket.
pub fn crawled_page_key(execution_id: Uuid, name: &str) -> String {
  format!(
    "crawled/{}/pages/{}",
    execution_id,
    sanitize_filename::sanitize(name)
  )
}

pub fn crawled_asset_key(execution_id: Uuid, asset_type: &str, name: &str) -> String {
  format!(
    "crawled/{}/assets/{}/{}",
    execution_id,
    asset_type,
    sanitize_filename::sanitize(name)
  )
}

pub fn crawled_file_key(execution_id: Uuid, name: &str) -> String {
  format!(
    "crawled/{}/files/{}",
    execution_id,
    sanitize_filename::sanitize(name)
  )
}

pub fn crawled_merged_key(execution_id: Uuid, name: &str) -> String {
  format!(
    "crawled/{}/merged/{}.pdf",
    execution_id,
    sanitize_filename::sanitize(name)
  )
}

pub fn upload_key(main_job_id: Uuid, name: &str) -> String {
  format!("{}/{}", main_job_id, sanitize_filename::sanitize(name))
}

pub fn page_pdf_key(main_job_id: Uuid, page_number: u32) -> String {
  format!("{}/page_{:04}.pdf", main_job_id, page_number)
}

pub fn page_markdown_key(main_job_id: Uuid, page_number: u32) -> String {
  format!("{}/page_{:04}.md", main_job_id, page_number)
}

pub fn result_key(main_job_id: Uuid) -> String {
  format!("{}/result.md", main_job_id)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_crawled_key_layout() {
    let execution_id = Uuid::nil();
    assert_eq!(
      crawled_page_key(execution_id, "index.html"),
      format!("crawled/{}/pages/index.html", execution_id)
    );
    assert_eq!(
      crawled_asset_key(execution_id, "css", "site.css"),
      format!("crawled/{}/assets/css/site.css", execution_id)
    );
    assert_eq!(
      crawled_merged_key(execution_id, "combined"),
      format!("crawled/{}/merged/combined.pdf", execution_id)
    );
  }

  #[test]
  fn test_keys_are_sanitized() {
    let key = crawled_file_key(Uuid::nil(), "../../etc/passwd");
    assert!(!key.contains(".."));
  }
}
