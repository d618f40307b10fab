use anyhow::Context;
use clap::Parser;
use dns_resolver::{HickoryResolver, Resolver};
use server_lifecycle::LifeCycle;
use smtpd::config::DaemonConfig;
use smtpd::diagnostic_logging::{DiagnosticFormat, LoggingConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(about = "extensible SMTP receiving daemon")]
struct Opt {
    /// Configuration file to load.
    /// If omitted, the built-in defaults are used.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory where diagnostic log files will be placed.
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,

    /// Load the configuration and wire up the hooks, then exit
    /// without listening.
    #[arg(long)]
    validate: bool,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("smtpd-main")
        .build()
        .context("building the main runtime")?
        .block_on(async move { run(opts).await })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let _log_guard = LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        filter_env_var: "SMTPD_LOG",
        default_filter: "smtpd=info",
        diag_format: opts.diag_format,
    }
    .init()?;

    let config = match &opts.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    for (name, &threads) in &config.thread_pools {
        server_runtime::set_pool_threads(name, threads);
    }

    let resolver: Arc<dyn Resolver> = Arc::new(
        HickoryResolver::from_system_conf().context("initializing the DNS resolver")?,
    );

    if opts.validate {
        let registry = smtpd::build_registry(&config, resolver);
        let dispatcher = smtpd::build_dispatcher(&config, &registry)?;
        println!(
            "configuration OK; handling {}",
            dispatcher.verbs().join(", ")
        );
        return Ok(());
    }

    if !config.smtp.enabled {
        tracing::info!("SMTP service is disabled; nothing to do");
        return Ok(());
    }

    let mut life_cycle = LifeCycle::new("smtpd");
    let mut listener = smtpd::start_listener(&config, resolver).await?;

    tokio::select! {
        requested = life_cycle.wait_for_shutdown_request() => requested?,
        closed = listener.closed() => {
            closed?;
        }
    }

    if !listener.shutdown(config.smtp.shutdown_grace).await {
        tracing::info!("some connections were forcibly closed");
    }
    life_cycle.begin_shutdown();

    tracing::info!("Shutdown completed OK!");
    Ok(())
}
