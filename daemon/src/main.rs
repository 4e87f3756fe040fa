mod api;
mod args;
mod config;
mod deploy;
mod error;
mod jobs;
mod report;
mod upload;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use ota_common::broker::{Broker, Message};
use ota_common::deploy::DeployMessage;
use ota_common::storage::{ObjectStore, S3ObjectStore};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use crate::args::Args;
use crate::config::Config;
use crate::jobs::JobMap;

const DEPLOY_BUFFER_SIZE: usize = 100;
const UPLOAD_BUFFER_SIZE: usize = 100;

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

    let deploy_topic = topics.deploy(&config.robot_id);
    let ack_topic = topics.ack(&config.robot_id);
    let state_topic = topics.state(&config.robot_id);

    let client_id = format!("ota-daemon-{}", config.robot_id);
    let (broker, messages) = Broker::connect(
        &config.broker,
        &client_id,
        vec![deploy_topic.clone(), ack_topic.clone()],
    );

    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&config.s3));
    let jobs = JobMap::default();

    let (deploy_send, deploy_recv) = mpsc::channel(DEPLOY_BUFFER_SIZE);
    tokio::spawn(deploy::task(deploy_recv, jobs.clone(), store));

    let (upload_send, upload_recv) = mpsc::channel(UPLOAD_BUFFER_SIZE);
    tokio::spawn(upload::task(upload_recv, config.cloud_service_url.clone()));

    tokio::spawn(report::task(jobs.clone(), broker, state_topic));

    tokio::spawn(dispatch(messages, deploy_topic, ack_topic, jobs, deploy_send));

    let router = api::make_router(upload_send);
    let addr = SocketAddr::new(args.host, args.port);

    info!(%addr, robot_id = config.robot_id.as_str(), "starting OTA daemon");

    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await
        .unwrap_or_else(|_| panic!("failed to bind to address: {}", addr));
}

/// Routes broker messages: deploy messages enter the job map and the deploy
/// queue, acks evict. Malformed payloads are logged and dropped.
async fn dispatch(
    mut messages: mpsc::Receiver<Message>,
    deploy_topic: String,
    ack_topic: String,
    jobs: JobMap,
    deploy_send: mpsc::Sender<DeployMessage>,
) {
    while let Some(message) = messages.recv().await {
        if message.topic == deploy_topic {
            let job: DeployMessage = match serde_json::from_slice(&message.payload) {
                Ok(job) => job,
                Err(error) => {
                    error!(
                        error = &error as &dyn std::error::Error,
                        "invalid deploy message"
                    );
                    continue;
                }
            };

            // Redelivery of a known job is a no-op.
            if !jobs.insert_received(job.job_id) {
                continue;
            }

            info!(job_id = %job.job_id, "deploy job received");

            if deploy_send.send(job).await.is_err() {
                return;
            }
        } else if message.topic == ack_topic {
            let raw = String::from_utf8_lossy(&message.payload);
            match Uuid::parse_str(raw.trim()) {
                Ok(job_id) => {
                    if jobs.evict(&job_id) {
                        info!(%job_id, "job acked");
                    }
                }
                Err(_) => warn!(payload = %raw, "invalid ack payload"),
            }
        }
    }
}
