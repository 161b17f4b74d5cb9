//! The `run` command: start a node and serve until a shutdown signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Args;

use crate::cluster::{BullyCluster, Cluster, EmptyCluster};
use crate::config;
use crate::{metrics, telemetry, Server};

// Exit codes are part of the operational contract.
const EXIT_CONFIG_LOAD: i32 = 1;
const EXIT_CONFIG_VERIFY: i32 = 2;
const EXIT_CLUSTER_START: i32 = 3;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// The host:port address to serve the server on.
    #[arg(long, value_name = "ADDR")]
    pub addr: Option<String>,
}

pub fn execute(args: RunArgs) -> i32 {
    let mut config = match config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load server config: {err}");
            return EXIT_CONFIG_LOAD;
        }
    };
    if let Some(addr) = args.addr {
        config.addr = addr;
    }

    telemetry::init(&config.logging);

    if let Err(err) = config.verify() {
        tracing::error!("failed to verify server config: {err}");
        return EXIT_CONFIG_VERIFY;
    }

    let cluster: Arc<dyn Cluster> = match &config.cluster {
        Some(settings) => match BullyCluster::new(settings.clone()) {
            Ok(cluster) => Arc::new(cluster),
            Err(err) => {
                tracing::error!("could not build cluster: {err}");
                return EXIT_CLUSTER_START;
            }
        },
        None => Arc::new(EmptyCluster::new()),
    };
    if let Err(err) = cluster.start() {
        tracing::error!("could not start cluster: {err}");
        return EXIT_CLUSTER_START;
    }

    let reporter = if config.metrics.enabled {
        metrics::enable();
        let (stop_tx, stop_rx) = crossbeam::channel::bounded(1);
        let interval = Duration::from_secs(config.metrics.interval.max(1));
        let handle = metrics::spawn_reporter(interval, stop_rx);
        Some((stop_tx, handle))
    } else {
        None
    };

    let server = match Server::start(&config, Arc::clone(&cluster)) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!("could not start server: {err}");
            let _ = cluster.shutdown();
            return EXIT_CONFIG_LOAD;
        }
    };

    wait_for_shutdown_signal();
    tracing::info!("shutting down server");

    server.stop();
    if let Err(err) = cluster.shutdown() {
        tracing::warn!("cluster shutdown reported an error: {err}");
    }
    if let Some((stop_tx, handle)) = reporter {
        let _ = stop_tx.send(());
        let _ = handle.join();
    }

    0
}

fn wait_for_shutdown_signal() {
    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }
}
