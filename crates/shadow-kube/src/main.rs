//! shadowctl - operate shadow pods from the command line.
//!
//! Every subcommand is a thin wrapper over one `shadow-core` operation run
//! against the cluster from the ambient kubeconfig. Logs go to stderr;
//! command results go to stdout, as JSON lines with `--json`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shadow_core::{
    CancellationToken, ExecBridge, HeartbeatUpdater, LabelSelector, LifecyclePoller,
    RefCountManager, ResourceWatcher, RuntimeInstance, ShadowConfig, TerminateOutcome, WatchEvent,
    WatchTarget,
};
use shadow_kube::{KubePodStore, SHADOW_CONTAINER};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Wait on, share and exec into shadow pods.
#[derive(Debug, Parser)]
#[command(name = "shadowctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Namespace of the pods (overrides SHADOW_NAMESPACE).
    #[arg(long, short = 'n', global = true)]
    namespace: Option<String>,

    /// Print pods as JSON lines instead of `name phase`.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Wait until a pod is Running.
    Wait {
        pod: String,
        /// Seconds to wait.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Wait until pods matching a label selector are Running.
    WaitSet {
        /// Labels as key=value.
        #[arg(required = true, value_parser = parse_label)]
        labels: Vec<(String, String)>,
        /// Seconds to wait.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// Running pods required.
        #[arg(long, default_value_t = 1)]
        min: usize,
    },

    /// Wait until a pod is gone.
    Terminate { pod: String },

    /// Run a command in a pod and print its output.
    Exec {
        pod: String,
        /// Container to run in.
        #[arg(long, short = 'c', default_value = SHADOW_CONTAINER)]
        container: String,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print pod events until interrupted.
    Watch {
        /// Watch a single pod by name.
        #[arg(long, conflicts_with = "selector")]
        name: Option<String>,
        /// Watch pods matching key=value labels.
        #[arg(long, value_parser = parse_label)]
        selector: Vec<(String, String)>,
    },

    /// Change the ref count of a shared pod.
    Ref {
        #[command(subcommand)]
        action: RefAction,
    },

    /// Keep stamping the heartbeat annotation on a pod until interrupted.
    Heartbeat {
        pod: String,
        /// Stamp once and exit.
        #[arg(long)]
        once: bool,
    },
}

#[derive(Debug, Subcommand)]
enum RefAction {
    /// Add a reference.
    Inc { pod: String },
    /// Drop a reference; prints whether the pod should be removed.
    Dec { pod: String },
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

fn selector_from(labels: Vec<(String, String)>) -> LabelSelector {
    labels
        .into_iter()
        .fold(LabelSelector::new(), |sel, (k, v)| sel.with(k, v))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("shadow_core=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = ShadowConfig::from_env();
    if let Some(ns) = cli.namespace {
        config.namespace = ns;
    }
    config.validate().context("invalid configuration")?;
    tracing::debug!(?config, "Configuration loaded");

    let store = Arc::new(KubePodStore::try_default().await?);
    let ns = config.namespace.clone();
    let json = cli.json;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command {
        Commands::Wait { pod, timeout } => {
            let poller = LifecyclePoller::new(store, config.poll_config()).with_cancellation(cancel);
            let pod = poller
                .wait_until_running(&pod, &ns, Duration::from_secs(timeout))
                .await?;
            print_instance(&pod, json)?;
        }

        Commands::WaitSet { labels, timeout, min } => {
            let poller = LifecyclePoller::new(store, config.poll_config()).with_cancellation(cancel);
            let ready = poller
                .wait_until_set_ready(&selector_from(labels), &ns, Duration::from_secs(timeout), min)
                .await?;
            for pod in &ready {
                print_instance(pod, json)?;
            }
        }

        Commands::Terminate { pod } => {
            let poller = LifecyclePoller::new(store, config.poll_config()).with_cancellation(cancel);
            match poller.wait_until_terminated(&pod, &ns).await? {
                TerminateOutcome::Terminated => println!("{pod} terminated"),
                TerminateOutcome::StillPresent(p) => {
                    bail!("pod {} is present and no longer terminating ({})", p.name(), p.phase)
                }
            }
        }

        Commands::Exec { pod, container, command } => {
            let bridge = ExecBridge::new(store, config.exec_config());
            match bridge.exec(&container, &pod, &ns, command).await {
                Ok(out) => {
                    if !out.stdout.is_empty() {
                        println!("{}", out.stdout);
                    }
                    if !out.stderr.is_empty() {
                        eprintln!("{}", out.stderr);
                    }
                }
                Err(shadow_core::CoreError::RemoteCommand { message, stdout, stderr }) => {
                    if !stdout.is_empty() {
                        println!("{stdout}");
                    }
                    if !stderr.is_empty() {
                        eprintln!("{stderr}");
                    }
                    bail!(message);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Watch { name, selector } => {
            let target = match name {
                Some(name) => WatchTarget::Name(name),
                None => WatchTarget::Selector(selector_from(selector)),
            };
            let watcher = ResourceWatcher::new(store, config.reconnect_policy());
            let mut events = watcher.subscribe(target, &ns);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => print_event(&event, json)?,
                        None => break,
                    },
                }
            }
            events.shutdown().await?;
        }

        Commands::Ref { action } => {
            let refs = RefCountManager::new(store, config.retry_policy());
            match action {
                RefAction::Inc { pod } => {
                    let count = refs.increment(&pod, &ns).await?;
                    println!("{pod} refs={count}");
                }
                RefAction::Dec { pod } => {
                    let should_cleanup = refs.decrement(&pod, &ns).await?;
                    println!("{pod} cleanup={should_cleanup}");
                }
            }
        }

        Commands::Heartbeat { pod, once } => {
            let updater = HeartbeatUpdater::new(store);
            if once {
                if !updater.tick(&pod, &ns).await {
                    bail!("failed to update heartbeat on {pod}");
                }
            } else {
                updater
                    .spawn(&pod, &ns, config.heartbeat_interval, cancel)
                    .await
                    .context("heartbeat task failed")?;
            }
        }
    }

    Ok(())
}

fn print_instance(pod: &RuntimeInstance, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(pod)?);
    } else {
        println!("{} {}", pod.name(), pod.phase);
    }
    Ok(())
}

fn print_event(event: &WatchEvent, json: bool) -> Result<()> {
    let pod = event.instance();
    if json {
        let line = serde_json::json!({ "type": event.kind(), "object": pod });
        println!("{line}");
    } else {
        println!("{:<9} {} {}", event.kind(), pod.name(), pod.phase);
    }
    Ok(())
}
