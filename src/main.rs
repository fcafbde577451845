use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

use clusterdns::metrics::serve_prometheus_endpoint_task;
use clusterdns::name_table::{self, SharedNameTable};
use clusterdns::protocol::types::DomainName;
use clusterdns::responder::Responder;
use clusterdns::server::listen_udp;
use clusterdns::settings::{parse_nameserver, Settings, RESOLV_CONF_PATH};

/// Reload the Name Table every `reload_interval_secs`, if set, and
/// whenever the process gets SIGHUP.
async fn reload_task(settings: Settings, names: Arc<SharedNameTable>) {
    let mut ticker = settings.reload_interval().map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });
    let mut hangup = Hangup::new();

    loop {
        tokio::select! {
            () = next_tick(&mut ticker) => tracing::debug!("reload interval elapsed"),
            () = hangup.recv() => tracing::info!("got SIGHUP"),
        }

        // failures are logged and counted, and the old table stays
        let _ = names
            .reload(
                &settings.authoritative_suffix,
                &settings.records,
                &settings.hosts_files,
            )
            .await;
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
struct Hangup(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl Hangup {
    fn new() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::hangup()) {
            Ok(sig) => Self(Some(sig)),
            Err(error) => {
                tracing::warn!(?error, "could not install SIGHUP handler");
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        if let Some(sig) = &mut self.0 {
            if sig.recv().await.is_some() {
                return;
            }
            self.0 = None;
        }
        std::future::pending().await
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending().await
    }
}

fn begin_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match std::env::var("RUST_LOG_FORMAT").as_deref() {
        Ok("json") => subscriber.json().init(),
        Ok("compact") => subscriber.compact().init(),
        Ok("pretty") => subscriber.pretty().init(),
        _ => subscriber.init(),
    }
}

fn nameserver_arg(s: &str) -> Result<SocketAddr, String> {
    parse_nameserver(s).ok_or_else(|| format!("'{s}' is not an IP address or socket address"))
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// A split-horizon DNS server for clusters.
///
/// Names under the authoritative suffix are answered from a table of
/// IPv4 addresses, built from static records and hosts files.  Every
/// other query is forwarded to an upstream nameserver and its
/// response relayed unchanged.
///
/// Settings come from the YAML file given by --config, then from
/// CLUSTERDNS_* environment variables, then from these flags.
struct Args {
    /// Path to a YAML settings file
    #[arg(short, long, env = "CLUSTERDNS_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on [default: 0.0.0.0:53]
    #[arg(short, long, env = "CLUSTERDNS_BIND_ADDRESS")]
    bind_address: Option<SocketAddr>,

    /// Names under this suffix are answered locally and never
    /// forwarded [default: cluster.local.]
    #[arg(short = 's', long, env = "CLUSTERDNS_AUTHORITATIVE_SUFFIX")]
    authoritative_suffix: Option<DomainName>,

    /// Nameserver to forward other queries to, as an IP address
    /// with optional port [default: first nameserver in
    /// /etc/resolv.conf]
    #[arg(short, long, env = "CLUSTERDNS_UPSTREAM_NAMESERVER", value_parser = nameserver_arg)]
    upstream_nameserver: Option<SocketAddr>,

    /// How long to wait for the upstream nameserver, in milliseconds
    /// [default: 5000]
    #[arg(long, env = "CLUSTERDNS_UPSTREAM_TIMEOUT_MS")]
    upstream_timeout_ms: Option<u64>,

    /// TTL of local answers, in seconds [default: 30]
    #[arg(long, env = "CLUSTERDNS_ANSWER_TTL")]
    answer_ttl: Option<u32>,

    /// Path to a hosts file, can be specified more than once
    #[arg(short = 'a', long, env = "CLUSTERDNS_HOSTS_FILES", value_delimiter = ',')]
    hosts_file: Vec<PathBuf>,

    /// Re-read hosts files and static records this often, in
    /// seconds.  SIGHUP always triggers a reload
    #[arg(long, env = "CLUSTERDNS_RELOAD_INTERVAL_SECS")]
    reload_interval_secs: Option<u64>,

    /// Address to serve Prometheus metrics on
    #[arg(long, env = "CLUSTERDNS_METRICS_ADDRESS")]
    metrics_address: Option<SocketAddr>,
}

impl Args {
    fn apply(self, settings: &mut Settings) {
        if let Some(bind_address) = self.bind_address {
            settings.bind_address = bind_address;
        }
        if let Some(suffix) = self.authoritative_suffix {
            settings.authoritative_suffix = suffix;
        }
        if let Some(upstream) = self.upstream_nameserver {
            settings.upstream_nameserver = Some(upstream);
        }
        if let Some(timeout) = self.upstream_timeout_ms {
            settings.upstream_timeout_ms = timeout;
        }
        if let Some(ttl) = self.answer_ttl {
            settings.answer_ttl = ttl;
        }
        if !self.hosts_file.is_empty() {
            settings.hosts_files = self.hosts_file;
        }
        if let Some(secs) = self.reload_interval_secs {
            settings.reload_interval_secs = Some(secs);
        }
        if let Some(address) = self.metrics_address {
            settings.metrics_address = Some(address);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    let mut settings = match Settings::new(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(error) => {
            tracing::error!(path = ?args.config, %error, "could not load settings");
            process::exit(1);
        }
    };
    args.apply(&mut settings);

    if let Err(error) = settings.validate() {
        tracing::error!(%error, "invalid settings");
        process::exit(1);
    }

    let upstream_nameserver =
        match settings.upstream_nameserver_or_resolv_conf(Path::new(RESOLV_CONF_PATH)) {
            Ok(address) => address,
            Err(error) => {
                tracing::error!(%error, "could not determine upstream nameserver");
                process::exit(1);
            }
        };

    let table = match name_table::load(
        &settings.authoritative_suffix,
        &settings.records,
        &settings.hosts_files,
    )
    .await
    {
        Ok(table) => table,
        Err(error) => {
            tracing::error!(?error, "could not load name table");
            process::exit(1);
        }
    };
    tracing::info!(entries = %table.len(), "loaded name table");

    let names = Arc::new(SharedNameTable::new(table));
    let responder = Arc::new(Responder {
        authoritative_suffix: settings.authoritative_suffix.clone(),
        upstream_nameserver,
        upstream_timeout: settings.upstream_timeout(),
        answer_ttl: settings.answer_ttl,
        names: names.clone(),
    });

    let udp = match UdpSocket::bind(settings.bind_address).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(address = %settings.bind_address, ?error, "could not bind UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(
        address = %settings.bind_address,
        suffix = %settings.authoritative_suffix,
        upstream = %upstream_nameserver,
        "listening"
    );

    if let Some(address) = settings.metrics_address {
        tracing::info!(%address, "serving metrics");
        tokio::spawn(async move {
            if let Err(error) = serve_prometheus_endpoint_task(address).await {
                tracing::error!(%address, ?error, "could not serve metrics");
                process::exit(1);
            }
        });
    }

    tokio::spawn(listen_udp(responder, udp));

    reload_task(settings, names).await;
}
