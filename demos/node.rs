use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use clap::Parser;
use mangamesh_dht::DhtNode;
use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about = "Run a mangamesh DHT node", long_about = None)]
struct Cli {
    /// Port to listen on, random if omitted
    #[arg(short, long)]
    port: Option<u16>,

    /// Bootstrap endpoints, `host:port`
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Seconds between status logs
    #[arg(long, default_value_t = 30)]
    status_interval: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();

    let mut builder = DhtNode::builder();
    builder.bootstrap(&cli.bootstrap);
    if let Some(port) = cli.port {
        builder.port(port);
    }

    let node = builder.build().expect("Failed to start node");

    info!(id = %node.id(), local_addr = ?node.local_addr(), "Node running, Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let bootstrapped = node.bootstrapped();
    info!(bootstrapped, "Bootstrap finished");

    let mut elapsed = Duration::ZERO;
    let status_interval = Duration::from_secs(cli.status_interval.max(1));

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
        elapsed += Duration::from_millis(200);

        if elapsed >= status_interval {
            elapsed = Duration::ZERO;

            let info = node.info();
            info!(
                state = %info.state(),
                routing_table_size = info.routing_table_size(),
                pending_requests = info.pending_requests(),
                provided_hashes = info.provided_hashes(),
                inbound_connections = info.inbound_connections(),
                "Status"
            );
        }
    }

    node.shutdown();
}
