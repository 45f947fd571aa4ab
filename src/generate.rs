use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Args as ClapArgs;
use tracing::info;
use url::Url;

use crate::clash::{clash_config, write_yaml, ClashOptions};
use crate::source::{cache_path_for, grab_servers, FetchOptions, DEFAULT_USER_AGENT};

const SUBSCRIPTION_BASE: &str = "https://jjsubmarines.com/members/getsub.php";

#[derive(ClapArgs, Debug, Clone)]
pub struct Args {
  /// Clash config to write. Without it the config is printed to stdout.
  #[arg(short = 'f', long)]
  pub path: Option<PathBuf>,

  /// HTTP listen port; the SOCKS port is this plus one.
  #[arg(short, long, default_value_t = 1082)]
  pub port: u16,

  /// Accept connections from the LAN.
  #[arg(short = 'n', long, default_value_t = false)]
  pub allow_lan: bool,

  /// Subscription service id.
  #[arg(short, long)]
  pub service: Option<String>,

  /// Subscription account uuid.
  #[arg(short, long)]
  pub uuid: Option<String>,

  /// Full subscription URL, overrides --service/--uuid.
  #[arg(long)]
  pub url: Option<String>,

  /// Share-link placed ahead of every subscription server.
  #[arg(short = 'b', long)]
  pub fallback: Option<String>,

  /// Emit Clash.Meta rule providers and geo rules.
  #[arg(short, long, default_value_t = false)]
  pub meta: bool,

  /// Request timeout (ms).
  #[arg(long, default_value_t = 15_000)]
  pub timeout_ms: u64,

  /// User-Agent header.
  #[arg(long, default_value = DEFAULT_USER_AGENT)]
  pub user_agent: String,
}

pub fn subscription_url(args: &Args) -> Result<Url> {
  if let Some(raw) = &args.url {
    return Url::parse(raw).with_context(|| format!("invalid subscription url: {raw}"));
  }
  let (Some(service), Some(uuid)) = (&args.service, &args.uuid) else {
    return Err(anyhow!(
      "missing subscription (provide --url, or --service and --uuid)"
    ));
  };
  let url = Url::parse_with_params(
    SUBSCRIPTION_BASE,
    &[
      ("service", service.as_str()),
      ("id", uuid.as_str()),
      ("usedomains", "1"),
    ],
  )?;
  Ok(url)
}

pub async fn run(args: Args) -> Result<()> {
  let url = subscription_url(&args)?;
  let opts = FetchOptions {
    timeout_ms: args.timeout_ms,
    user_agent: args.user_agent.clone(),
  };
  let cache_file = args.path.as_deref().map(cache_path_for);

  let servers = grab_servers(
    url.as_str(),
    cache_file.as_deref(),
    args.fallback.as_deref(),
    &opts,
  )
  .await;

  let doc = clash_config(
    &servers,
    &ClashOptions {
      port: args.port,
      allow_lan: args.allow_lan,
      meta: args.meta,
    },
  );

  match &args.path {
    Some(path) => {
      write_yaml(path, &doc)?;
      info!(path = %path.display(), proxies = servers.len(), "clash config written");
    }
    None => print!("{}", serde_yaml::to_string(&doc).context("serialize yaml")?),
  }
  Ok(())
}
