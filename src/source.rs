use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SubError};
use crate::node::ServerNode;
use crate::sub_parse::{parse_node_from_uri_line, parse_subscription_text};

pub const DEFAULT_USER_AGENT: &str = "curl/8.5.0";
pub const CACHE_FILE_NAME: &str = "cache.txt";

#[derive(Debug, Clone)]
pub struct FetchOptions {
  pub timeout_ms: u64,
  pub user_agent: String,
}

impl Default for FetchOptions {
  fn default() -> Self {
    Self {
      timeout_ms: 15_000,
      user_agent: DEFAULT_USER_AGENT.to_string(),
    }
  }
}

pub fn cache_path_for(output: &Path) -> PathBuf {
  output
    .parent()
    .map(|p| p.join(CACHE_FILE_NAME))
    .unwrap_or_else(|| PathBuf::from(CACHE_FILE_NAME))
}

/// Downloads the raw (still encoded) subscription body.
/// System proxies are bypassed since the proxy being configured may be down.
pub async fn fetch_subscription(url: &str, opts: &FetchOptions) -> Result<String> {
  let client = Client::builder()
    .user_agent(opts.user_agent.clone())
    .no_proxy()
    .timeout(Duration::from_millis(opts.timeout_ms.max(1)))
    .build()?;

  let resp = client.get(url).send().await?;
  let status = resp.status();
  if !status.is_success() {
    return Err(SubError::HttpStatus(status.as_u16()));
  }
  let text = resp.text().await?;
  debug!(bytes = text.len(), "fetched subscription");
  Ok(text)
}

pub async fn subscription_to_servers(
  url: &str,
  cache_file: Option<&Path>,
  opts: &FetchOptions,
) -> Result<Vec<ServerNode>> {
  let raw = fetch_subscription(url, opts).await?;
  let decoded = parse_subscription_text(&raw)?;

  if let Some(path) = cache_file {
    if let Err(e) = tokio::fs::write(path, &raw).await {
      warn!(path = %path.display(), "can not write cache: {e}");
    }
  }
  Ok(decoded.servers)
}

pub async fn cache_to_servers(cache_file: &Path) -> Result<Vec<ServerNode>> {
  let raw = tokio::fs::read_to_string(cache_file)
    .await
    .map_err(|source| SubError::Cache {
      path: cache_file.to_path_buf(),
      source,
    })?;
  Ok(parse_subscription_text(&raw)?.servers)
}

/// Servers from the subscription, else from the cache, else none.
/// A decodable `fallback` share-link is always placed first.
pub async fn grab_servers(
  url: &str,
  cache_file: Option<&Path>,
  fallback: Option<&str>,
  opts: &FetchOptions,
) -> Vec<ServerNode> {
  let mut servers = match subscription_to_servers(url, cache_file, opts).await {
    Ok(servers) => servers,
    Err(e) => {
      error!("can not read subscription, trying last cache: {e}");
      match cache_file {
        Some(path) => cache_to_servers(path).await.unwrap_or_else(|e| {
          error!("{e}");
          Vec::new()
        }),
        None => Vec::new(),
      }
    }
  };

  if let Some(link) = fallback {
    if let Some(node) = parse_node_from_uri_line(link) {
      info!(
        scheme = node.protocol().scheme(),
        tag = node.tag(),
        "using fallback server"
      );
      servers.insert(0, node);
    }
  }
  info!(count = servers.len(), "servers ready");
  servers
}

#[cfg(test)]
mod tests {
  use super::*;
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine;

  #[test]
  fn cache_sits_next_to_output() {
    assert_eq!(
      cache_path_for(Path::new("/etc/clash/config.yaml")),
      PathBuf::from("/etc/clash/cache.txt")
    );
    assert_eq!(
      cache_path_for(Path::new("config.yaml")),
      PathBuf::from("cache.txt")
    );
  }

  #[tokio::test]
  async fn cache_round_trip_decodes_raw_body() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CACHE_FILE_NAME);
    let raw = STANDARD.encode("ss://aes-256-gcm:pw@1.2.3.4:8388#a\nbogus\n");
    std::fs::write(&path, raw).unwrap();

    let servers = cache_to_servers(&path).await.unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].tag(), "a");
  }

  #[tokio::test]
  async fn missing_cache_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = cache_to_servers(&dir.path().join("absent.txt")).await.unwrap_err();
    assert!(matches!(err, SubError::Cache { .. }));
  }

  #[tokio::test]
  async fn unreachable_subscription_falls_back_to_cache_and_link() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CACHE_FILE_NAME);
    std::fs::write(&path, STANDARD.encode("ss://m:k@9.9.9.9:1#cached")).unwrap();

    let opts = FetchOptions {
      timeout_ms: 500,
      ..FetchOptions::default()
    };
    let servers = grab_servers(
      "http://127.0.0.1:9/sub",
      Some(&path),
      Some("ss://m:k@8.8.8.8:2#fallback"),
      &opts,
    )
    .await;
    let tags: Vec<&str> = servers.iter().map(|s| s.tag()).collect();
    assert_eq!(tags, ["fallback", "cached"]);
  }
}
