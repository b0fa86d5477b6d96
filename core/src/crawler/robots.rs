use reqwest::Client;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// Per-execution robots.txt checker. The file is fetched once per host and
/// cached for the lifetime of the execution; an unreachable robots.txt
/// allows everything.
pub struct RobotsChecker {
  client: Client,
  user_agent: String,
  enabled: bool,
  cache: Mutex<HashMap<String, Vec<String>>>,
}

/// Disallow prefixes that apply to the given user agent, from the matching
/// `User-agent` sections (`*` included).
pub fn parse_disallow(content: &str, user_agent: &str) -> Vec<String> {
  let user_agent = user_agent.to_ascii_lowercase();
  let mut disallow = Vec::new();
  let mut section_applies = false;
  let mut in_section_header = false;

  for line in content.lines() {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
      continue;
    }
    let Some((field, value)) = line.split_once(':') else {
      continue;
    };
    let field = field.trim().to_ascii_lowercase();
    let value = value.trim();

    match field.as_str() {
      "user-agent" => {
        let agent = value.to_ascii_lowercase();
        let matches = agent == "*" || user_agent.contains(&agent);
        if in_section_header {
          section_applies = section_applies || matches;
        } else {
          section_applies = matches;
        }
        in_section_header = true;
      }
      "disallow" => {
        in_section_header = false;
        if section_applies && !value.is_empty() {
          disallow.push(value.to_string());
        }
      }
      _ => {
        in_section_header = false;
      }
    }
  }
  disallow
}

impl RobotsChecker {
  pub fn new(client: Client, user_agent: String, enabled: bool) -> Self {
    Self {
      client,
      user_agent,
      enabled,
      cache: Mutex::new(HashMap::new()),
    }
  }

  async fn disallow_for_host(&self, url: &Url) -> Vec<String> {
    let Some(host) = url.host_str() else {
      return vec![];
    };
    let key = format!("{}://{}", url.scheme(), host);
    let mut cache = self.cache.lock().await;
    if let Some(rules) = cache.get(&key) {
      return rules.clone();
    }

    let robots_url = format!("{}/robots.txt", key);
    let rules = match self.client.get(&robots_url).send().await {
      Ok(response) if response.status().is_success() => match response.text().await {
        Ok(content) => parse_disallow(&content, &self.user_agent),
        Err(_) => vec![],
      },
      _ => {
        debug!(host = host, "No robots.txt, allowing everything");
        vec![]
      }
    };
    cache.insert(key, rules.clone());
    rules
  }

  pub async fn allowed(&self, url: &Url) -> bool {
    if !self.enabled {
      return true;
    }
    let rules = self.disallow_for_host(url).await;
    let path = url.path();
    !rules.iter().any(|prefix| path.starts_with(prefix.as_str()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const ROBOTS: &str = "
# example robots file
User-agent: *
Disallow: /private/
Disallow: /tmp/

User-agent: docmill
Disallow: /no-crawlers/

User-agent: otherbot
Disallow: /
";

  #[test]
  fn test_parse_disallow_wildcard_section() {
    let rules = parse_disallow(ROBOTS, "someagent/1.0");
    assert_eq!(rules, vec!["/private/".to_string(), "/tmp/".to_string()]);
  }

  #[test]
  fn test_parse_disallow_specific_agent() {
    let rules = parse_disallow(ROBOTS, "docmill/0.1");
    assert!(rules.contains(&"/no-crawlers/".to_string()));
    assert!(!rules.contains(&"/".to_string()));
  }
}
