use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Result, anyhow};
use clap::Parser;
use observer::{
    bridge::KeyValueStore,
    cfg::Config,
    crypto::SecretKey,
    db::SqliteStore,
    metrics::Metrics,
    node_launcher::{Collaborators, ObserverNode},
    p2p_node::P2pNode,
    rpc_bridge::RpcBridge,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use tokio::{
    signal::{self, unix::SignalKind},
    sync::watch,
    time::Duration,
};
use tracing::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(value_parser = SecretKey::from_hex)]
    secret_key: SecretKey,
    #[clap(long, short, default_values = ["config.toml"])]
    config_file: Vec<PathBuf>,
    #[clap(long, default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .with_ansi(false);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    // Set a panic hook that records the panic as a `tracing` event at the `ERROR` verbosity level.
    std::panic::set_hook(Box::new(|panic| {
        let message = match panic.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");

        let backtrace = Backtrace::capture();
        let backtrace =
            (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());

        match (panic.location(), backtrace) {
            (None, None) => {
                error!(thread_name, message);
            }
            (None, Some(backtrace)) => {
                error!(thread_name, message, %backtrace);
            }
            (Some(location), None) => {
                error!(
                    thread_name,
                    message,
                    panic.file = location.file(),
                    panic.line = location.line(),
                    panic.column = location.column(),
                );
            }
            (Some(location), Some(backtrace)) => {
                error!(
                    thread_name,
                    message,
                    panic.file = location.file(),
                    panic.line = location.line(),
                    panic.column = location.column(),
                    %backtrace,
                );
            }
        }
    }));

    let mut merged_config = toml::Table::new();
    for config_file in args.config_file {
        let config = fs::read_to_string(&config_file)?;
        let config: toml::Table = toml::from_str(&config)?;
        for key in config.keys() {
            if merged_config.contains_key(key) {
                return Err(anyhow!(
                    "configuration conflict: {config_file:?} contained a key {key:?} that was already included in an earlier file"
                ));
            }
        }
        merged_config.extend(config);
    }

    let config: Config = serde::Deserialize::deserialize(merged_config)?;
    config.validate()?;

    let meter_provider = match &config.otlp_collector_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.clone())
                .build()?;
            let reader = PeriodicReader::builder(exporter)
                .with_interval(Duration::from_secs(10))
                .build();
            let provider = SdkMeterProvider::builder().with_reader(reader).build();
            opentelemetry::global::set_meter_provider(provider.clone());
            Some(provider)
        }
        None => None,
    };

    // Chain clients are provided by embedders of the library. This binary only relays attestations.
    for chain in &config.observer.chains {
        warn!(%chain, "no chain client available, nothing will be observed on this chain");
    }

    let p2p_node = P2pNode::new(&args.secret_key, &config)?;
    let host = p2p_node.host();
    let (p2p_shutdown, p2p_shutdown_receiver) = watch::channel(false);
    let p2p_task = tokio::spawn(p2p_node.run(p2p_shutdown_receiver));

    let bridge = Arc::new(RpcBridge::new(&config.bridge)?);
    let store = match &config.data_dir {
        Some(data_dir) => Some(Arc::new(SqliteStore::open(data_dir)?) as Arc<dyn KeyValueStore>),
        None => None,
    };

    let node = ObserverNode::launch(
        args.secret_key,
        &config,
        Collaborators {
            bridge: bridge.clone(),
            events: bridge,
            host,
            clients: Vec::new(),
            store,
        },
        Metrics::new(),
    )
    .await?;

    let mut terminate = signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = terminate.recv() => {}
        _ = signal::ctrl_c() => {}
    }
    info!("shutting down");

    node.shutdown().await?;
    let _ = p2p_shutdown.send(true);
    p2p_task.await??;
    if let Some(provider) = meter_provider {
        provider.shutdown()?;
    }
    Ok(())
}
