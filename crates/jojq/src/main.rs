//! jojq command line entry point

use clap::{Args, Parser, Subcommand};
use jojq_proxy::{CertificateManager, Proxy, ProxyConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod console;

#[derive(Parser)]
#[command(
  name = "jojq",
  version,
  about = "Intercept JSON API traffic through a local proxy and explore it offline"
)]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Run the interception proxy
  Proxy(ProxyArgs),
  /// Print the root CA certificate path, generating the CA if needed
  Ca(CaArgs),
}

#[derive(Args, Debug)]
struct ProxyArgs {
  /// Port to listen on
  #[arg(default_value_t = jojq_proxy::DEFAULT_PORT)]
  port: u16,

  /// Decrypt HTTPS traffic; the root CA must be trusted by the client
  #[arg(long)]
  insecure: bool,

  /// Directory for the root CA key and certificate
  #[arg(long, env = "JOJQ_CA_DIR", default_value = ".jojq")]
  ca_dir: PathBuf,

  /// Maximum number of retained captures
  #[arg(long, default_value_t = jojq_proxy::DEFAULT_CAPACITY)]
  max_captures: usize,

  /// Increase log verbosity (-v, -vv)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,
}

#[derive(Args, Debug)]
struct CaArgs {
  /// Directory for the root CA key and certificate
  #[arg(long, env = "JOJQ_CA_DIR", default_value = ".jojq")]
  ca_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
  let cli = Cli::parse();
  match cli.command {
    Command::Proxy(args) => run_proxy(args).await,
    Command::Ca(args) => run_ca(args).await,
  }
}

async fn run_proxy(args: ProxyArgs) -> ExitCode {
  init_tracing(args.verbose);

  let config = ProxyConfig {
    port: args.port,
    mitm: args.insecure,
    ca_dir: args.ca_dir,
    max_captures: args.max_captures,
    ..Default::default()
  };
  let proxy = match Proxy::bind(config).await {
    Ok(proxy) => proxy,
    Err(e) => {
      tracing::error!("startup failed: {e}");
      return ExitCode::FAILURE;
    }
  };

  if let Some(path) = proxy.ca_cert_path() {
    println!(
      "HTTPS interception enabled; trust this root CA in your client: {}",
      path.display()
    );
  }
  println!("proxy listening on {}", proxy.local_addr());

  let buffer = proxy.buffer();
  let shutdown = proxy.shutdown_handle();

  // SIGINT closes the listener and lets in-flight handlers drain; the
  // process ends when the operator leaves the console.
  tokio::spawn({
    let shutdown = shutdown.clone();
    async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        shutdown.notify_one();
      }
    }
  });

  let server = tokio::spawn(proxy.run());
  console::run(buffer).await;
  shutdown.notify_one();
  if let Ok(Err(e)) = server.await {
    tracing::error!("proxy terminated with error: {e}");
    return ExitCode::FAILURE;
  }
  ExitCode::SUCCESS
}

async fn run_ca(args: CaArgs) -> ExitCode {
  init_tracing(0);
  match CertificateManager::new(&args.ca_dir).await {
    Ok(manager) => {
      println!("{}", manager.ca_cert_path().display());
      ExitCode::SUCCESS
    }
    Err(e) => {
      tracing::error!("failed to prepare CA: {e}");
      ExitCode::FAILURE
    }
  }
}

fn init_tracing(verbose: u8) {
  let base = match verbose {
    0 => "info",
    1 => "debug",
    _ => "trace",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(base));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}
