// File: main.rs
//
// The purpose of this file is to initialize the node process: parse the
// command line, load configuration, bring the node into a ring, and run
// until interrupted.

use log::error;
use quoit::{proxy, server, Config, Node, PredecessorMonitor, Server};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use structopt::StructOpt;

/// Holds data parsed from the command line to initialize the node
#[derive(StructOpt, Debug)]
#[structopt(name = "quoit")]
pub struct Cli {
    /// Config file
    #[structopt(long, default_value = "quoit.conf")]
    conf: PathBuf,

    /// Port to serve on
    #[structopt(short, long)]
    port: Option<u16>,

    /// Id value of the node
    #[structopt(long)]
    id: Option<u128>,

    /// Logging filter directives, e.g. "quoit=debug"
    #[structopt(long = "log-config")]
    log_config: Option<String>,

    /// Turn on request logging in the RPC server
    #[structopt(long = "log-requests")]
    log_requests: bool,

    /// Verbose output from RPC clients
    #[structopt(long = "proxy-verbose")]
    proxy_verbose: bool,
}

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::from_args();

    let mut logger = env_logger::Builder::from_default_env();
    if let Some(filter) = &cli.log_config {
        logger.parse_filters(filter);
    }
    logger.init();

    let mut config = match Config::load(&cli.conf) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(id) = cli.id {
        config.node_id = Some(id);
    }
    if cli.log_requests {
        config.log_requests = true;
    }
    if cli.proxy_verbose {
        config.proxy_verbose = true;
    }

    proxy::set_verbose(config.proxy_verbose);

    let metric = match config.metric() {
        Ok(metric) => metric,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    let node = Node::new(config.node_id, None, metric);

    let server = match Server::start(node.clone(), &config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("fatal error while setting up server: {}", e);
            return 1;
        }
    };
    let own_url = server.url().to_string();
    if let Err(e) = server::join_ring(&node, &own_url, &config.cloud_members) {
        eprintln!("fatal error while joining the ring: {}", e);
        server.stop();
        return 1;
    }

    let monitor = PredecessorMonitor::spawn(node.clone(), Duration::from_secs(config.heartbeat));

    println!("Serving on port {}", config.port);
    println!("Use Ctrl-C to exit");

    let (stop_tx, stop_rx) = chan::sync(1);
    if let Err(e) = ctrlc::set_handler(move || stop_tx.send(())) {
        eprintln!("unable to install the signal handler: {}", e);
        monitor.stop();
        server.stop();
        return 1;
    }
    let _ = stop_rx.recv();

    println!("Exiting");
    monitor.stop();
    if let Err(e) = node.leave() {
        error!("error while leaving the ring: {}", e);
    }
    server.stop();
    0
}
