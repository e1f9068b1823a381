use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use kew_controller::{compile_scopes, run_all, Renderer, SinkSet};
use kew_core::config::DEFAULT_CONFIG_PATH;
use kew_kubehub::kube_client;
use kew_sinks::{ChatClient, CwLogsClient, LogBackend, MemoryLogBackend, RawOutput, SdkLogsClient, SequenceTokenManager, SlackClient, TokenRetry, DEFAULT_SLACK_API_URL};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const APP_TITLE: &str = "kube-event-watcher";

#[derive(Parser, Debug)]
#[command(name = "kew", version, about = "Watch Kubernetes events and forward them to chat, logs and metrics")]
struct Cli {
    /// Watch configuration (YAML list of scopes)
    #[arg(long, env = "KEW_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Kubeconfig path; inferred (KUBECONFIG, ~/.kube/config, in-cluster) when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Notify events to Slack
    #[arg(long, env = "KEW_NOTIFY_SLACK", action = ArgAction::Set, num_args = 0..=1, default_value_t = true, default_missing_value = "true")]
    notify_slack: bool,

    #[arg(long, env = "SLACK_TOKEN", hide_env_values = true, default_value = "")]
    slack_token: String,

    /// Default Slack channel, also the fallback for unknown scope channels
    #[arg(long, env = "SLACK_CHANNEL", default_value = "")]
    slack_channel: String,

    #[arg(long, env = "KEW_SLACK_TEMPLATE_FILE")]
    slack_template_file: Option<PathBuf>,

    #[arg(long, env = "KEW_SLACK_API_URL", default_value = DEFAULT_SLACK_API_URL)]
    slack_api_url: String,

    /// Append events to CloudWatch Logs
    #[arg(long, env = "KEW_CW_LOGGING", action = ArgAction::Set, num_args = 0..=1, default_value_t = false, default_missing_value = "true")]
    cw_logging: bool,

    #[arg(long, env = "KEW_CW_LOG_GROUP", default_value = "kube-event-watcher")]
    cw_log_group: String,

    /// Default log stream; scopes may override it
    #[arg(long, env = "KEW_CW_LOG_STREAM", default_value = "event")]
    cw_log_stream: String,

    #[arg(long, env = "KEW_CWLOGS_TEMPLATE_FILE")]
    cwlogs_template_file: Option<PathBuf>,

    /// CloudWatch Logs endpoint (signing proxy or emulator); `memory` keeps records
    /// in-process; unset talks to AWS with the default credential chain
    #[arg(long, env = "KEW_CW_ENDPOINT")]
    cw_endpoint: Option<String>,

    /// Print delivered events to stdout as JSON
    #[arg(long, env = "KEW_PUT_STDOUT", action = ArgAction::Set, num_args = 0..=1, default_value_t = false, default_missing_value = "true")]
    put_stdout: bool,

    /// Prometheus exporter address
    #[arg(long, env = "KEW_LISTEN_ADDRESS", default_value = "0.0.0.0:9297")]
    listen_address: String,

    /// Worker loops per scope
    #[arg(long, env = "KEW_WORKERS", default_value_t = 1)]
    workers: usize,
}

fn init_tracing() {
    let env = std::env::var("KEW_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout is reserved for --put-stdout records.
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: &str) -> Result<()> {
    let sock = addr.parse::<std::net::SocketAddr>().with_context(|| format!("invalid --listen-address {addr}; expected host:port"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(sock)
        .install()
        .context("installing prometheus exporter")?;
    info!(addr = %addr, "metrics listening");
    Ok(())
}

async fn build_sinks(cli: &Cli) -> Result<SinkSet> {
    let chat: Option<Arc<dyn ChatClient>> = if cli.notify_slack {
        if cli.slack_token.is_empty() || cli.slack_channel.is_empty() {
            bail!("slack error: token or channel is empty");
        }
        info!(channel = %cli.slack_channel, "slack notifications enabled");
        Some(Arc::new(SlackClient::new(cli.slack_token.clone(), cli.slack_api_url.clone())?))
    } else {
        info!("slack notifications disabled");
        None
    };

    let log = if cli.cw_logging {
        let backend: Arc<dyn LogBackend> = match cli.cw_endpoint.as_deref() {
            Some("memory") => {
                warn!("cloudwatch logs endpoint is in-memory; records are not persisted");
                Arc::new(MemoryLogBackend::new())
            }
            Some(url) => Arc::new(CwLogsClient::new(url)?),
            None => Arc::new(SdkLogsClient::from_env().await),
        };
        info!(group = %cli.cw_log_group, stream = %cli.cw_log_stream, "cloudwatch logging enabled");
        Some(Arc::new(SequenceTokenManager::new(backend, TokenRetry::default())))
    } else {
        info!("cloudwatch logging disabled");
        None
    };

    Ok(SinkSet {
        metrics: true,
        chat,
        default_channel: cli.slack_channel.clone(),
        log,
        log_group: cli.cw_log_group.clone(),
        default_stream: cli.cw_log_stream.clone(),
        raw: cli.put_stdout.then(|| Arc::new(RawOutput::stdout())),
    })
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let configs = kew_core::load_config(&cli.config).with_context(|| format!("loading {}", cli.config))?;
    let scopes = compile_scopes(configs)?;
    let renderer = Arc::new(Renderer::load(cli.slack_template_file.as_deref(), cli.cwlogs_template_file.as_deref())?);
    let sinks = Arc::new(build_sinks(&cli).await?);
    let client = kube_client(cli.kubeconfig.as_deref()).await?;

    // Startup notice doubles as a check that both sinks accept writes.
    let notices = sinks.default_dispatcher();
    if let Some(m) = &sinks.log {
        m.ensure_group(&sinks.log_group).await.context("cloudwatch log group check")?;
    }
    let (chat, log) = notices.announce(APP_TITLE, "application start", "Normal").await;
    chat.context("slack startup message")?;
    log.context("cloudwatch startup record")?;

    init_metrics(&cli.listen_address)?;

    let stop = CancellationToken::new();
    let run = tokio::spawn(run_all(client, scopes, sinks.clone(), renderer, cli.workers, stop.clone()));

    shutdown_signal().await;
    info!("shutdown signal received");
    stop.cancel();
    match run.await {
        Ok(Err(e)) => error!(error = %e, "controllers stopped with error"),
        Err(e) => error!(error = %e, "controller task failed"),
        Ok(Ok(())) => {}
    }

    let (chat, log) = notices.announce(APP_TITLE, "application exit", "Warning").await;
    if let Err(e) = chat {
        warn!(error = %e, "slack exit message failed");
    }
    if let Err(e) = log {
        warn!(error = %e, "cloudwatch exit record failed");
    }
    Ok(())
}
