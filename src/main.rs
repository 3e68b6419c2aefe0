#[macro_use]
extern crate slog;

use clap::{App, Arg};

use concord_core::config::NodeConfig;
use concord_core::logger::get_root_logger;
use concord_node::http::run_http_loop;
use concord_node::tcp::run_accept_loop;
use concord_node::{build_node, NodeHandle};

#[tokio::main(flavor = "multi_thread", worker_threads = 3)]
async fn main() {
    let matches = App::new("concord")
        .version("0.1.0")
        .author("jcm")
        .about("A small replicated transaction engine, switchable between Raft and Paxos.")
        .arg(
            Arg::with_name("node-id")
                .long("node-id")
                .value_name("ID")
                .help("Overrides NODE_ID for this process."),
        )
        .arg(
            Arg::with_name("algorithm")
                .long("algorithm")
                .value_name("raft|paxos")
                .help("Overrides ALGORITHM for this process."),
        )
        .get_matches();

    if let Some(id) = matches.value_of("node-id") {
        std::env::set_var("NODE_ID", id);
    }
    if let Some(algorithm) = matches.value_of("algorithm") {
        std::env::set_var("ALGORITHM", algorithm);
    }

    let logger = get_root_logger();
    let config = NodeConfig::from_env().expect("invalid node configuration");

    info!(logger, "starting node";
        "node_id" => config.node_id,
        "algorithm" => config.algorithm.to_string(),
        "tcp_port" => config.tcp_port,
        "http_port" => config.http_port,
    );

    let (handle, actor): (NodeHandle, _) = build_node(&config, logger.clone());
    tokio::spawn(actor);

    let tcp_addr = format!("{}:{}", config.node_ip, config.tcp_port);
    let tcp_listener = tokio::net::TcpListener::bind(&tcp_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind peer socket {}: {}", tcp_addr, e));
    let peer_handle = handle.clone();
    let peer_logger = logger.new(slog::o!("component" => "tcp"));
    tokio::spawn(async move {
        let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::channel(256);
        let forward_logger = peer_logger.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbound_rx.recv().await {
                peer_handle.deliver_inbound(envelope).await;
            }
            debug!(forward_logger, "inbound forwarding task ended");
        });
        run_accept_loop(tcp_listener, inbound_tx, peer_logger).await;
    });

    let http_addr = format!("{}:{}", config.node_ip, config.http_port);
    let http_listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind http socket {}: {}", http_addr, e));
    let http_logger = logger.new(slog::o!("component" => "http"));
    let http_handle = handle.clone();
    tokio::spawn(async move {
        run_http_loop(http_listener, http_handle, http_logger).await;
    });

    info!(logger, "node ready"; "tcp" => &tcp_addr, "http" => &http_addr);

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    info!(logger, "shutting down");
}
