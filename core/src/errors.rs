use thiserror::Error;

/// Error taxonomy shared by every component. Components keep `anyhow` for
/// their internals and surface one of these kinds at their boundary.
#[derive(Error, Debug)]
pub enum CoreError {
  #[error("invalid input: {0}")]
  InvalidInput(String),
  #[error("not found: {0}")]
  NotFound(String),
  #[error("conflict: {0}")]
  Conflict(String),
  #[error("transient: {0}")]
  Transient(String),
  #[error("fatal: {0}")]
  Fatal(String),
  #[error("cancelled")]
  Cancelled,
}

impl CoreError {
  pub fn is_transient(&self) -> bool {
    matches!(self, CoreError::Transient(_) | CoreError::Conflict(_))
  }
}

/// Extracts the error kind from an `anyhow` chain, defaulting to `Fatal`
/// for uncaught errors so workers ack instead of hot-looping.
pub fn classify(error: &anyhow::Error) -> &'static str {
  match error.downcast_ref::<CoreError>() {
    Some(CoreError::InvalidInput(_)) => "invalid_input",
    Some(CoreError::NotFound(_)) => "not_found",
    Some(CoreError::Conflict(_)) => "conflict",
    Some(CoreError::Transient(_)) => "transient",
    Some(CoreError::Fatal(_)) => "fatal",
    Some(CoreError::Cancelled) => "cancelled",
    None => "fatal",
  }
}

pub fn is_retryable(error: &anyhow::Error) -> bool {
  error
    .downcast_ref::<CoreError>()
    .map(|e| e.is_transient())
    .unwrap_or(false)
}

/// Truncates an error message before it is written to a job row.
pub fn truncate_error_message(message: &str) -> String {
  const MAX_ERROR_BYTES: usize = 8 * 1024;
  if message.len() <= MAX_ERROR_BYTES {
    return message.to_string();
  }
  let mut end = MAX_ERROR_BYTES;
  while !message.is_char_boundary(end) {
    end -= 1;
  }
  message[..end].to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classify_core_error() {
    let error = anyhow::Error::new(CoreError::Conflict("version mismatch".to_string()));
    assert_eq!(classify(&error), "conflict");
    assert!(is_retryable(&error));

    let error = anyhow::Error::new(CoreError::Fatal("corrupt input".to_string()));
    assert_eq!(classify(&error), "fatal");
    assert!(!is_retryable(&error));

    let error = anyhow::anyhow!("something else");
    assert_eq!(classify(&error), "fatal");
  }

  #[test]
  fn test_truncate_error_message() {
    let short = truncate_error_message("oops");
    assert_eq!(short, "oops");

    let long = "x".repeat(10_000);
    let truncated = truncate_error_message(&long);
    assert_eq!(truncated.len(), 8 * 1024);
  }
}
