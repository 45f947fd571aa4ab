use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Args as ClapArgs;
use tracing::info;

use crate::clash::{attach_provider, provider_document, read_yaml, write_yaml};
use crate::source::{subscription_to_servers, FetchOptions, DEFAULT_USER_AGENT};

#[derive(ClapArgs, Debug, Clone)]
pub struct Args {
  /// Extra subscription URL.
  #[arg(short, long)]
  pub link: String,

  /// Proxy-provider file to write.
  #[arg(short = 'f', long)]
  pub path: PathBuf,

  /// Main Clash config that should reference the provider.
  #[arg(short, long = "main")]
  pub main_config: PathBuf,

  /// Name of the url-test group added to the main config.
  #[arg(short, long, default_value = "extra")]
  pub name: String,

  /// Request timeout (ms).
  #[arg(long, default_value_t = 15_000)]
  pub timeout_ms: u64,

  /// User-Agent header.
  #[arg(long, default_value = DEFAULT_USER_AGENT)]
  pub user_agent: String,
}

/// Adds the provider at `provider_path` to the Clash config at `main_path`.
pub fn modify_main_config(main_path: &Path, provider_path: &Path, name: &str) -> Result<()> {
  let file_name = provider_path
    .file_name()
    .and_then(|n| n.to_str())
    .ok_or_else(|| anyhow!("invalid provider path: {}", provider_path.display()))?;
  let name = if name.trim().is_empty() { "extra" } else { name };

  let mut doc = read_yaml(main_path)?;
  attach_provider(&mut doc, file_name, name)
    .with_context(|| format!("update {}", main_path.display()))?;
  write_yaml(main_path, &doc)
}

pub async fn run(args: Args) -> Result<()> {
  let opts = FetchOptions {
    timeout_ms: args.timeout_ms,
    user_agent: args.user_agent.clone(),
  };
  let servers = subscription_to_servers(&args.link, None, &opts)
    .await
    .context("read extra subscription")?;

  write_yaml(&args.path, &provider_document(&servers))?;
  info!(path = %args.path.display(), proxies = servers.len(), "provider written");

  modify_main_config(&args.main_config, &args.path, &args.name)?;
  info!(path = %args.main_config.display(), group = %args.name, "main config updated");
  Ok(())
}
