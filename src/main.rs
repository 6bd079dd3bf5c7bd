mod address;
mod allocator;
mod config;
mod eager_env;
mod gossip;
mod paxos;
mod peer;
mod ring;
mod server;
mod space;
mod store;
mod tracker;
mod utils;

use crate::{
    allocator::Allocator,
    config::Settings,
    eager_env::check_env,
    gossip::http::HttpGossip,
    server::{AppStateInner, start_server},
    store::FileStore,
    tracker::{LogTracker, RangeTracker},
};
use std::{net::TcpListener, sync::Arc};

#[tokio::main]
async fn main() {
    // Variables already in the environment win over .env
    let _ = dotenvy::dotenv();
    env_logger::builder()
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();
    check_env();

    let settings = Settings::from_env().expect("invalid configuration");
    let default_subnet = settings.config.default_subnet;

    let store = FileStore::open(&settings.data_dir).expect("failed to open the data directory");
    let (gossip, stop_gossip) = HttpGossip::start(
        settings.config.our_name.clone(),
        settings.internal_password.clone(),
        settings.gossip_peers,
    )
    .expect("failed to start gossip");
    let tracker: Option<Box<dyn RangeTracker>> = if settings.track_ranges {
        Some(Box::new(LogTracker))
    } else {
        None
    };

    let mut core = Allocator::new(settings.config, Box::new(store), Box::new(gossip), tracker);
    core.start(Vec::new()).expect("failed to start the allocator");
    let (handle, stop_allocator) = allocator::spawn(core);

    let state = Arc::new(AppStateInner {
        allocator: handle.clone(),
        default_subnet,
        internal_password: settings.internal_password,
    });
    let listener =
        TcpListener::bind(format!("0.0.0.0:{}", settings.port)).expect("Failed to bind PORT");

    println!(
        "Listening on {}",
        listener.local_addr().expect("Failed to get local address")
    );

    start_server(state, listener)
        .await
        .expect("error while running server");

    if let Err(e) = handle.shutdown().await {
        log::warn!("allocator did not shut down cleanly: {e}");
    }
    stop_allocator();
    stop_gossip();
}
