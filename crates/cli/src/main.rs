use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::core::DynamicObject;
use kube::Client;
use mirra_core::{ListWatch, Object, ObjectKey, Selector, TweakListOptions};
use mirra_informer::{HandlerFuncs, InformerConfig, SharedInformerFactory, TypedInformer};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mirractl", version, about = "Mirra CLI: mirror a Kubernetes resource and query it")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "MIRRA_NAMESPACE")]
    namespace: Option<String>,

    /// Give up if the initial list has not been mirrored within this many seconds
    #[arg(long = "sync-timeout", global = true, env = "MIRRA_SYNC_TIMEOUT_SECS", default_value_t = 30)]
    sync_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Mirror a resource and list the cached objects
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cluster.x-k8s.io/v1beta1/MachineDeployment"
        gvk: String,
        /// Label selector, e.g. "app=web,tier in (a,b)"
        #[arg(short = 'l', long = "selector", default_value = "")]
        selector: String,
        /// Field selector on metadata.name / metadata.namespace
        #[arg(long = "field-selector", default_value = "")]
        field_selector: String,
        /// Push the label selector to the server instead of filtering the full mirror
        #[arg(long = "server-side")]
        server_side: bool,
    },
    /// Mirror a resource and print one object by key
    Get {
        gvk: String,
        /// "namespace/name", or "name" for cluster-scoped kinds
        key: String,
    },
    /// Print add (+), update (~), resync (=) and delete (-) notifications until Ctrl-C
    Watch {
        gvk: String,
        #[arg(short = 'l', long = "selector", default_value = "")]
        selector: String,
        /// Also print periodic resync notifications
        #[arg(long = "resyncs")]
        resyncs: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("MIRRA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter =
        tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MIRRA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MIRRA_METRICS_ADDR; expected host:port");
        }
    }
}

/// A started factory mirroring one dynamic resource.
struct Mirror {
    factory: Arc<SharedInformerFactory>,
    typed: TypedInformer<DynamicObject>,
}

impl Mirror {
    async fn open(client: Client, cli: &Cli, gvk: &str, tweak: Option<TweakListOptions>) -> Result<Self> {
        let ns = cli.namespace.as_deref();
        let (lw, _namespaced) = mirra_kubehub::dynamic_list_watch(client, gvk, ns).await?;
        let mut factory = SharedInformerFactory::new(InformerConfig::from_env());
        if let Some(ns) = ns {
            factory = factory.with_namespace(ns);
        }
        if let Some(tweak) = tweak {
            factory = factory.with_tweak_list_options(tweak);
        }
        let factory = Arc::new(factory);
        let lw: Arc<dyn ListWatch<DynamicObject>> = Arc::new(lw);
        let typed = TypedInformer::new(Arc::clone(&factory), lw);
        Ok(Self { factory, typed })
    }

    async fn start_and_sync(&self, timeout: Duration) -> Result<()> {
        self.typed.informer();
        self.factory.start();
        let synced = tokio::time::timeout(timeout, self.factory.wait_for_cache_sync())
            .await
            .context("timed out waiting for the initial list")?;
        if let Some((kind, _)) = synced.iter().find(|(_, ok)| !ok) {
            bail!("informer for {} stopped before syncing", kind);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.factory.shutdown().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let sync_timeout = Duration::from_secs(cli.sync_timeout);

    match &cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let client = Client::try_default().await.context("building kube client")?;
            let resources = mirra_kubehub::discover(client).await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {}", gv, r.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Ls { gvk, selector, field_selector, server_side } => {
            info!(gvk = %gvk, ns = ?cli.namespace, selector = %selector, "ls invoked");
            let parsed = Selector::parse(selector, field_selector).context("parsing selectors")?;
            let tweak = server_side.then(|| label_tweak(selector.clone()));
            let client = Client::try_default().await.context("building kube client")?;
            let mirror = Mirror::open(client, &cli, gvk, tweak).await?;
            mirror.start_and_sync(sync_timeout).await?;

            let lister = mirror.typed.lister();
            let mut items = match cli.namespace.as_deref() {
                Some(ns) => lister.namespaced(ns).list(&parsed),
                None => lister.list(&parsed),
            };
            items.sort_by_key(|o| o.key());
            match cli.output {
                Output::Human => {
                    println!("{:<20} {:<40} {:<10} AGE", "NAMESPACE", "NAME", "VERSION");
                    for o in items.iter() {
                        println!(
                            "{:<20} {:<40} {:<10} {}",
                            Object::namespace(&**o).unwrap_or("-"),
                            Object::name(&**o).unwrap_or(""),
                            Object::resource_version(&**o).unwrap_or(""),
                            render_age(&**o)
                        );
                    }
                }
                Output::Json => {
                    let objs: Vec<&DynamicObject> = items.iter().map(|o| &**o).collect();
                    println!("{}", serde_json::to_string_pretty(&objs)?);
                }
            }
            mirror.shutdown().await;
        }
        Commands::Get { gvk, key } => {
            info!(gvk = %gvk, key = %key, "get invoked");
            let key = ObjectKey::parse(key).context("parsing object key")?;
            let client = Client::try_default().await.context("building kube client")?;
            let mirror = Mirror::open(client, &cli, gvk, None).await?;
            mirror.start_and_sync(sync_timeout).await?;

            let lister = mirror.typed.lister();
            let found = match key.namespace.as_deref() {
                Some(ns) => lister.get(ns, &key.name),
                None => lister.get_cluster(&key.name),
            };
            mirror.shutdown().await;
            let Some(obj) = found else {
                bail!("{} {} not found", gvk, key);
            };
            match cli.output {
                Output::Human => println!("{}", render_object(&obj)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&*obj)?),
            }
        }
        Commands::Watch { gvk, selector, resyncs } => {
            info!(gvk = %gvk, ns = ?cli.namespace, "watch invoked");
            let parsed = Selector::from_labels(selector).context("parsing label selector")?;
            let client = Client::try_default().await.context("building kube client")?;
            let mirror = Mirror::open(client, &cli, gvk, None).await?;

            let show = Arc::new(parsed);
            let (on_add, on_update, on_delete) = (Arc::clone(&show), Arc::clone(&show), show);
            let print_resyncs = *resyncs;
            let handler = HandlerFuncs::new("mirractl-watch")
                .with_add(move |o: &Arc<DynamicObject>, initial| {
                    if on_add.matches(&**o) {
                        let mark = if initial { "+" } else { "+ (new)" };
                        println!("{} {}", mark, display_key(o));
                    }
                })
                .with_update(move |old, new| {
                    if !on_update.matches(&**new) {
                        return;
                    }
                    if Arc::ptr_eq(old, new) {
                        if print_resyncs {
                            println!("= {}", display_key(new));
                        }
                    } else {
                        println!(
                            "~ {} {} -> {}",
                            display_key(new),
                            Object::resource_version(&**old).unwrap_or(""),
                            Object::resource_version(&**new).unwrap_or("")
                        );
                    }
                })
                .with_delete(move |o| {
                    if on_delete.matches(&**o) {
                        println!("- {}", display_key(o));
                    }
                });
            let informer = mirror.typed.informer();
            let registration = informer.add_event_handler(handler).await?;
            mirror.start_and_sync(sync_timeout).await?;
            info!(handler = %registration.name(), objects = informer.indexer().len(), "watching; Ctrl-C to stop");

            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received; shutting down");
            mirror.shutdown().await;
            if registration.dropped() > 0 {
                warn!(dropped = registration.dropped(), "notifications dropped while watching");
            }
        }
    }

    Ok(())
}

fn label_tweak(selector: String) -> TweakListOptions {
    Arc::new(move |opts| {
        if !selector.is_empty() {
            opts.label_selector = Some(selector.clone());
        }
    })
}

fn display_key(o: &DynamicObject) -> String {
    o.key().map(|k| k.to_string()).unwrap_or_else(|| "<unnamed>".to_string())
}

/// Compact human rendering: identity line plus the object body as indented JSON.
fn render_object(o: &DynamicObject) -> Result<String> {
    let body = serde_json::to_string_pretty(&o.data)?;
    Ok(format!(
        "{} (version {}, age {})\n{}",
        display_key(o),
        Object::resource_version(o).unwrap_or("-"),
        render_age(o),
        body
    ))
}

fn render_age(o: &DynamicObject) -> String {
    let Some(created) = o.metadata.creation_timestamp.as_ref() else {
        return "-".to_string();
    };
    let mut secs = (chrono::Utc::now() - created.0).num_seconds().max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
