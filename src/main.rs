use anyhow::Result;
use clap::{Parser, Subcommand};
use jms_clash::{extra, generate, sub_parse};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
  /// Emit trace-level diagnostics.
  #[arg(short, long, global = true, default_value_t = false)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Fetch the subscription (or its cache) and write a complete Clash config.
  Generate(generate::Args),

  /// Write an extra subscription as a proxy-provider and hook it into an existing Clash config.
  Extra(extra::Args),

  /// Decode subscription text (ss/vmess/vless share-links) and output one JSON line per server.
  Decode(sub_parse::Args),
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_max_level(if cli.verbose { Level::TRACE } else { Level::INFO })
    .init();

  match cli.command {
    Commands::Generate(args) => generate::run(args).await,
    Commands::Extra(args) => extra::run(args).await,
    Commands::Decode(args) => sub_parse::run(args).await,
  }
}
