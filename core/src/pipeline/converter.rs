use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConverterError {
  #[error("unsupported format: {0}")]
  UnsupportedFormat(String),
  #[error("corrupt input: {0}")]
  CorruptInput(String),
  #[error("conversion timed out")]
  Timeout,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConversionMeta {
  pub pages: u32,
  pub words: u32,
  pub format: String,
  pub size_bytes: u64,
  pub title: Option<String>,
  pub author: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Conversion {
  pub markdown: String,
  pub meta: ConversionMeta,
}

/// The document-to-markdown contract. Deterministic for the same input;
/// implementations classify failures so the workers can tell fatal inputs
/// from transient conditions.
#[async_trait]
pub trait Converter: Send + Sync {
  async fn convert(
    &self,
    bytes: &[u8],
    hint_format: Option<&str>,
  ) -> Result<Conversion, ConverterError>;
}

/// Built-in converter for PDF inputs, backed by the same PDF library the
/// split step uses. Anything that is not a PDF is refused.
pub struct PdfConverter;

#[async_trait]
impl Converter for PdfConverter {
  async fn convert(
    &self,
    bytes: &[u8],
    hint_format: Option<&str>,
  ) -> Result<Conversion, ConverterError> {
    if let Some(hint) = hint_format {
      if hint != "pdf" {
        return Err(ConverterError::UnsupportedFormat(hint.to_string()));
      }
    }
    let document = lopdf::Document::load_mem(bytes)
      .map_err(|e| ConverterError::CorruptInput(e.to_string()))?;
    let page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
    if page_numbers.is_empty() {
      return Err(ConverterError::CorruptInput("document has no pages".to_string()));
    }
    let text = document
      .extract_text(&page_numbers)
      .map_err(|e| ConverterError::CorruptInput(e.to_string()))?;
    let markdown = text.trim().to_string();
    let words = markdown.split_whitespace().count() as u32;
    Ok(Conversion {
      markdown,
      meta: ConversionMeta {
        pages: page_numbers.len() as u32,
        words,
        format: "pdf".to_string(),
        size_bytes: bytes.len() as u64,
        title: None,
        author: None,
      },
    })
  }
}
