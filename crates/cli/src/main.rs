use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kmirror_core::{LabelSelector, MirrorConfig, NameMatcher, ObjectStore, DEFAULT_QUEUE_CAP};
use kmirror_diff::SummaryDiff;
use kmirror_kubehub::{get_kube_client, watch_kinds, KubeResolver, KubeStore};
use kmirror_sync::{build_registry, run_once, Engine, Filter, FinalizerGuard, KindOutcome, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "kmirror", version, about = "Mirror the objects of one namespace into another")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Path to a kubeconfig file (default: in-cluster or ~/.kube/config)
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kube context of the source cluster
    #[arg(long, global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct Selection {
    /// Namespace to mirror from
    #[arg(short = 'n', long = "source-namespace", env = "KMIRROR_SOURCE_NS")]
    source_namespace: String,

    /// Label selector objects must match, e.g. "app=web,tier!=cache"
    #[arg(short = 'l', long = "selector")]
    selector: Option<String>,

    /// Kinds to mirror as `resource[.group]`, e.g. "configmaps", "deployment.apps", "*.apps" (default: all)
    #[arg(value_name = "MATCHER")]
    matchers: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror continuously until Ctrl-C
    Run {
        #[command(flatten)]
        selection: Selection,

        /// Namespace to mirror into
        #[arg(short = 't', long = "target-namespace", env = "KMIRROR_TARGET_NS")]
        target_namespace: String,

        /// Kube context of the target cluster (default: same as source)
        #[arg(long = "target-context")]
        target_context: Option<String>,

        /// Seconds to wait after the watches start before the bootstrap pass
        #[arg(long = "warmup-secs", default_value_t = 5)]
        warmup_secs: u64,
    },
    /// List the kinds that would be mirrored
    Kinds {
        #[command(flatten)]
        selection: Selection,
    },
}

/// Log filter from `KMIRROR_LOG`; an unparsable directive falls back to the default level
/// and the error is kept so it can be logged once tracing is up.
fn log_filter(directive: Option<&str>) -> (EnvFilter, Option<String>) {
    let directive = directive.unwrap_or("info");
    match EnvFilter::try_new(directive) {
        Ok(f) => (f, None),
        Err(e) => (EnvFilter::new("info"), Some(format!("ignoring KMIRROR_LOG={:?}: {}", directive, e))),
    }
}

fn init_tracing() {
    let directive = std::env::var("KMIRROR_LOG").ok();
    let (filter, rejected) = log_filter(directive.as_deref());
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    if let Some(msg) = rejected {
        warn!("{}", msg);
    }
}

/// Listen address for the Prometheus exporter. Unset or blank disables it.
fn metrics_addr(raw: Option<&str>) -> Result<Option<SocketAddr>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s.parse::<SocketAddr>().map(Some).with_context(|| format!("KMIRROR_METRICS_ADDR={:?} is not host:port", s)),
    }
}

fn init_metrics() -> Result<()> {
    let raw = std::env::var("KMIRROR_METRICS_ADDR").ok();
    let Some(addr) = metrics_addr(raw.as_deref())? else { return Ok(()) };
    PrometheusBuilder::new().with_http_listener(addr).install().context("installing metrics exporter")?;
    info!(addr = %addr, "serving metrics");
    Ok(())
}

fn queue_capacity() -> usize {
    std::env::var("KMIRROR_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(DEFAULT_QUEUE_CAP)
}

fn mirror_config(selection: &Selection, target_namespace: &str, warmup_secs: u64) -> Result<MirrorConfig> {
    let mut cfg = MirrorConfig::new(selection.source_namespace.clone(), target_namespace);
    cfg.matchers = selection.matchers.iter().map(|m| NameMatcher::parse(m)).collect::<Result<_, _>>()?;
    cfg.selector = match selection.selector.as_deref() {
        Some(s) => LabelSelector::parse(s)?,
        None => LabelSelector::everything(),
    };
    cfg.queue_capacity = queue_capacity();
    cfg.warmup = Duration::from_secs(warmup_secs);
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics()?;
    let cli = Cli::parse();
    let kubeconfig = cli.kubeconfig.as_deref();
    let context = cli.context.as_deref();

    match cli.command {
        Commands::Kinds { selection } => {
            // target is irrelevant for kind selection
            let cfg = mirror_config(&selection, "", 0)?;
            let client = get_kube_client(kubeconfig, context).await?;
            let resolver = KubeResolver::discover(client).await?;
            let registry = build_registry(&resolver, &Filter::from_config(&cfg));
            let kinds = registry.kinds();
            match cli.output {
                Output::Human => {
                    for k in &kinds {
                        let scope = if k.namespaced() { "namespaced" } else { "cluster (not mirrored)" };
                        println!("{} • {} • {}", k.id, k.plural, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
        }
        Commands::Run { selection, target_namespace, target_context, warmup_secs } => {
            let cfg = mirror_config(&selection, &target_namespace, warmup_secs)?;
            let same_cluster = target_context.is_none() || target_context.as_deref() == context;
            cfg.validate(same_cluster)?;
            run(cfg, kubeconfig, context, target_context.as_deref()).await?;
        }
    }
    Ok(())
}

async fn run(cfg: MirrorConfig, kubeconfig: Option<&std::path::Path>, context: Option<&str>, target_context: Option<&str>) -> Result<()> {
    let client = get_kube_client(kubeconfig, context).await?;
    let target_client = match target_context {
        Some(ctx) => get_kube_client(kubeconfig, Some(ctx)).await.context("target cluster")?,
        None => client.clone(),
    };
    let resolver = Arc::new(KubeResolver::discover(client.clone()).await?);
    let filter = Filter::from_config(&cfg);
    let registry = Arc::new(build_registry(resolver.as_ref(), &filter));
    metrics::gauge!("mirror_kinds", registry.len() as f64);
    info!(
        kinds = registry.len(),
        source = %cfg.source_namespace,
        target = %cfg.target_namespace,
        "mirror starting"
    );

    let source: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
    let target: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(target_client));
    let engine = Arc::new(Engine::new(source.clone(), target, cfg.target_namespace.clone()));

    let events = watch_kinds(client, &registry.kinds(), &cfg.source_namespace);
    let pipeline = Pipeline::new(filter.clone(), FinalizerGuard::new(source.clone()), engine.clone())
        .with_capacity(cfg.queue_capacity)
        .with_sink(Arc::new(SummaryDiff::new()))
        .start(events);

    // give the watches time to list before replaying everything through the engine
    let bootstrap = tokio::spawn({
        let registry = registry.clone();
        let warmup = cfg.warmup;
        async move {
            tokio::time::sleep(warmup).await;
            let report = run_once(&registry, resolver.as_ref(), source.as_ref(), &filter, &engine).await;
            let total = report.total();
            info!(
                created = total.created,
                updated = total.updated,
                unchanged = total.unchanged,
                retired = total.retired + total.removed,
                errors = total.errors,
                "bootstrap pass complete"
            );
            for (id, outcome) in &report.kinds {
                match outcome {
                    KindOutcome::Unsupported => warn!(gvk = %id, "kind skipped: cluster-scoped"),
                    KindOutcome::Unresolved(e) => warn!(gvk = %id, error = %e, "kind skipped: no longer served"),
                    KindOutcome::Failed(e) => error!(gvk = %id, error = %e, "kind skipped: list failed"),
                    KindOutcome::Synced(_) => {}
                }
            }
        }
    });

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; draining queued events");
    bootstrap.abort();
    let stats = pipeline.shutdown().await;
    info!(
        received = stats.producer.received,
        reconciled = stats.consumer.reconciled,
        errors = stats.consumer.errors,
        "mirror stopped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_parses_flags_and_matchers() {
        let cli = Cli::try_parse_from([
            "kmirror", "run", "-n", "team-a", "-t", "team-b", "-l", "mirror=yes", "--warmup-secs", "1", "configmaps", "*.apps",
        ])
        .unwrap();
        let Commands::Run { selection, target_namespace, target_context, warmup_secs } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(selection.source_namespace, "team-a");
        assert_eq!(target_namespace, "team-b");
        assert_eq!(target_context, None);
        assert_eq!(warmup_secs, 1);
        assert_eq!(selection.matchers, vec!["configmaps", "*.apps"]);

        let cfg = mirror_config(&selection, &target_namespace, warmup_secs).unwrap();
        assert_eq!(cfg.matchers.len(), 2);
        assert_eq!(cfg.matchers[1].group, "apps");
        assert!(!cfg.selector.is_empty());
        assert_eq!(cfg.warmup, Duration::from_secs(1));
        assert!(cfg.validate(true).is_ok());
    }

    #[test]
    fn bad_matcher_is_rejected() {
        let cli = Cli::try_parse_from(["kmirror", "kinds", "-n", "team-a", ".apps"]).unwrap();
        let Commands::Kinds { selection } = cli.command else { panic!("expected kinds") };
        assert!(mirror_config(&selection, "", 0).is_err());
    }

    #[test]
    fn log_filter_falls_back_on_bad_directive() {
        let (f, rejected) = log_filter(Some("kmirror_sync=debug,warn"));
        assert!(rejected.is_none());
        assert!(f.to_string().to_lowercase().contains("kmirror_sync=debug"));
        let (f, rejected) = log_filter(Some("kmirror_sync=loud"));
        assert!(f.to_string().eq_ignore_ascii_case("info"));
        assert!(rejected.unwrap().contains("kmirror_sync=loud"));
        assert!(log_filter(None).1.is_none());
    }

    #[test]
    fn metrics_addr_is_optional_but_must_parse() {
        assert_eq!(metrics_addr(None).unwrap(), None);
        assert_eq!(metrics_addr(Some("  ")).unwrap(), None);
        assert_eq!(metrics_addr(Some("127.0.0.1:9464")).unwrap(), Some("127.0.0.1:9464".parse().unwrap()));
        assert!(metrics_addr(Some("localhost")).is_err());
    }

    #[test]
    fn same_namespace_on_same_cluster_is_invalid() {
        let cli = Cli::try_parse_from(["kmirror", "run", "-n", "a", "-t", "a"]).unwrap();
        let Commands::Run { selection, target_namespace, .. } = cli.command else { panic!("expected run") };
        let cfg = mirror_config(&selection, &target_namespace, 5).unwrap();
        assert!(cfg.validate(true).is_err());
        assert!(cfg.validate(false).is_ok());
    }
}
