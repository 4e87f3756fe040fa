mod args;
mod config;
mod error;
mod handlers;
mod persistence;
mod service;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use ota_common::broker::Broker;
use ota_common::storage::S3ObjectStore;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use crate::args::Args;
use crate::config::Config;
use crate::persistence::Persistence;
use crate::service::OtaService;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let fmt_layer = fmt::layer();
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.verbose))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    let config = Config::load(&args.config).expect("failed to load config");
    let topics = config
        .broker
        .topic_pattern()
        .expect("invalid broker topic pattern");

    let persistence = Persistence::new(&config.database.path).await;
    let store = Arc::new(S3ObjectStore::new(&config.s3));

    let client_id = format!("ota-server-{}", Uuid::new_v4());
    let (broker, state_recv) = Broker::connect(
        &config.broker,
        &client_id,
        vec![topics.state_subscription()],
    );

    let service = OtaService::new(persistence.clone(), store, Arc::new(broker), topics);

    tokio::spawn(service::state_listener(service.clone(), state_recv));

    let router = handlers::make_router(service, persistence);
    let addr = SocketAddr::new(args.host, args.port);

    info!(%addr, "starting OTA file service");

    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await
        .unwrap_or_else(|_| panic!("failed to bind to address: {}", addr));
}
