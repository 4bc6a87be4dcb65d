use std::{path::Path, sync::Arc};

use anyhow::Context;
use clap::Parser;
use kube_service_selectors::init_logger;
use prometheus_client::registry::Registry;
use service_selectors::{
    collector::{Outcomes, SelectorsCollector},
    config::{self, Config},
    k8s::{ApiClient, Token},
    server,
};

const BINARY: &str = env!("CARGO_BIN_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main exporter function.
///
/// The steps are:
/// - parse the CLI
/// - parse the config file and apply the CLI overrides
/// - build the K8S client and register the collector
/// - serve the metrics until Ctrl+C
///
/// About errors: we use `anyhow::Result` and `context` instead of `expect` to get
/// nicer error messages (`expect` prints errors with `Debug`).
fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    init_logger(args.common.debug);
    log::info!("Starting '{BINARY}' v{VERSION}");

    let config_path = Path::new(&args.common.config);

    // Run CLI commands that run before the config is loaded.
    if let Some(cli::Command::Config(cli::ConfigArgs {
        command: cli::ConfigCommand::Regen,
    })) = args.command
    {
        // (re)generate the default config
        Config::default().write(config_path)?;
        log::info!("Default configuration file written to: {}", config_path.display());
        return Ok(());
    }

    let mut config =
        Config::load(config_path, !args.common.no_default_config).context("could not load config file")?;
    apply_overrides(&args.common, &mut config);
    log::debug!("{config:?}");

    run(config)
}

/// Overrides the config file with the arguments given on the command line.
fn apply_overrides(args: &cli::CommonArgs, config: &mut Config) {
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(namespaces) = &args.namespaces {
        config.namespaces = config::parse_namespaces(namespaces);
    }
    if let Some(timeout) = args.timeout {
        config.timeout = timeout;
    }
    if let Some(url) = &args.k8s_api_url {
        config.k8s_api_url = Some(url.clone());
    }
}

/// Serves the metrics until the process is externally stopped (e.g. by Ctrl+C).
fn run(config: Config) -> anyhow::Result<()> {
    let addr = config.listen_addr()?;
    let api_url = config.api_url();
    match config.namespaces.as_slice() {
        [] => log::info!("Watching the services of all namespaces with {api_url}"),
        namespaces => log::info!("Watching the services of namespaces {namespaces:?} with {api_url}"),
    }

    let token = Token::new(config.token_retrieval.clone().into());
    let client = ApiClient::new(&api_url, token, config.ca_cert().as_deref()).context("invalid K8S API settings")?;
    let collector = SelectorsCollector::new(client, config.fetch_settings(), Arc::new(Outcomes::default()));

    let mut registry = Registry::default();
    registry.register_collector(Box::new(collector));
    let registry = Arc::new(registry);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("metrics-server")
        .build()
        .context("failed to build the tokio runtime")?;

    // The registry holds a blocking HTTP client, which must not be dropped in an async context.
    let server_registry = registry.clone();
    rt.block_on(async move {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl+C: {e}");
                return;
            }
            log::info!("Ctrl+C received, stopping...");
        };
        let (_, task) = server::start(addr, server_registry, shutdown)?;
        task.await.context("the metrics server panicked")
    })
}

/// Exporter command-line interface (CLI).
///
/// We use `clap` to parse these options, therefore the structs
/// derive [`clap::Args`] or other clap trait implementations.
mod cli {
    use clap::{Args, Parser, Subcommand};
    use std::time::Duration;

    // NOTE: the doc comment attached to `Cli` is used by clap as the description of
    // the application. It is displayed at the start of the help message.

    /// Prometheus exporter of the selectors of Kubernetes services.
    #[derive(Parser)]
    #[command(version)]
    pub struct Cli {
        #[command(subcommand)]
        pub command: Option<Command>,

        #[command(flatten)]
        pub common: CommonArgs,
    }

    #[derive(Subcommand)]
    pub enum Command {
        /// Serve the metrics.
        ///
        /// This is the default command.
        Run,

        /// Manipulate the configuration.
        Config(ConfigArgs),
    }

    #[derive(Args)]
    pub struct ConfigArgs {
        #[command(subcommand)]
        pub command: ConfigCommand,
    }

    #[derive(Subcommand)]
    pub enum ConfigCommand {
        /// Regenerate the configuration file and stop.
        ///
        /// If the file exists, it will be overwritten.
        Regen,
    }

    #[derive(Args, Clone)]
    pub struct CommonArgs {
        /// Path to the config file.
        #[arg(long, env = "KUBE_SELECTORS_CONFIG", default_value = "kube-service-selectors.toml")]
        pub config: String,

        /// If set, the config file must exist, otherwise the exporter will fail to start with an error.
        #[arg(long, default_value_t = false)]
        pub no_default_config: bool,

        /// Port of the `/metrics` endpoint.
        #[arg(long)]
        pub port: Option<u16>,

        /// Namespaces to watch, separated by commas, ex. `default,monitoring`.
        ///
        /// An empty list means all the namespaces.
        #[arg(long)]
        pub namespaces: Option<String>,

        /// Timeout of each request to the K8S API, ex. `10s`.
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        pub timeout: Option<Duration>,

        /// URL of the K8S API, ex. `https://10.96.0.1:443`.
        #[arg(long)]
        pub k8s_api_url: Option<String>,

        /// Enables debug logs.
        #[arg(long, default_value_t = false)]
        pub debug: bool,
    }
}
