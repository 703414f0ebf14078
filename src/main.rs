//! meshy node binary.

use clap::Parser;
use meshy::net::{DEFAULT_PORT, DEFAULT_ROUTE_TIMEOUT_MS, MIN_ROUTE_TIMEOUT_MS};
use meshy::{Node, NodeConfig, Role};
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "meshy", version, about = "Peer-to-peer mesh packet forwarder")]
struct Args {
    /// Listen port
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Run as the destination node ('Z'): terminate packets with dest bit 1
    #[arg(short = 'z', conflicts_with = "source")]
    dest: bool,

    /// Run as the source node ('Q'): terminate packets with dest bit 0
    #[arg(short = 'q')]
    source: bool,

    /// Verbose logging
    #[arg(short = 'v')]
    verbose: bool,

    /// Route timeout in milliseconds (minimum 10)
    #[arg(short = 't', value_name = "MS")]
    route_timeout: Option<u64>,
}

fn main() {
    let args = Args::parse();

    // test harnesses force verbose mode through the environment
    let verbose =
        args.verbose || std::env::var("BE_VERBOSE").is_ok_and(|v| v == "1");
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("meshy={level}").parse().unwrap()),
        )
        .init();

    let role = if args.dest {
        Role::Destination
    } else if args.source {
        Role::Source
    } else {
        Role::Normal
    };

    let mut route_timeout_ms = DEFAULT_ROUTE_TIMEOUT_MS;
    if let Some(timeout) = args.route_timeout {
        if timeout < MIN_ROUTE_TIMEOUT_MS {
            warn!("route timeout of {} ms is below the minimum, ignored", timeout);
        } else {
            debug!("setting route timeout to {} ms", timeout);
            route_timeout_ms = timeout;
        }
    }

    let node = match Node::bind(NodeConfig {
        port: args.port,
        role,
        route_timeout_ms,
    }) {
        Ok(node) => node,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!(
        "node {} listening on port {}",
        role.letter(),
        node.local_addr().port()
    );

    if let Err(e) = node.run() {
        error!("{}", e);
        std::process::exit(1);
    }
}
