use std::time::Duration;

use ota_common::models::{FileCreate, FileCreateList, FileInfo};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{info, warn};

/// How long to wait before retrying while the cloud service is unavailable.
pub const UPLOAD_RETRY_PERIOD: Duration = Duration::from_secs(10);
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Drains the upload queue: each entry is a batch of local files to push to
/// the cloud service's upload endpoint.
pub async fn task(mut recv: mpsc::Receiver<Vec<FileInfo>>, cloud_service_url: String) {
    let client = Client::new();

    info!("upload worker started");

    while let Some(batch) = recv.recv().await {
        upload_batch(&client, &cloud_service_url, batch).await;
    }
}

async fn upload_batch(client: &Client, base_url: &str, batch: Vec<FileInfo>) {
    let mut file_list = Vec::new();
    let mut parts = Vec::new();

    for info in batch {
        let data = match tokio::fs::read(&info.local_path).await {
            Ok(data) => data,
            Err(error) => {
                warn!(
                    path = %info.local_path.display(),
                    error = &error as &dyn std::error::Error,
                    "skipping unreadable file"
                );
                continue;
            }
        };

        let mut part = Part::bytes(data);
        if let Some(file_name) = info.local_path.file_name() {
            part = part.file_name(file_name.to_string_lossy().into_owned());
        }
        parts.push(part);

        file_list.push(FileCreate {
            bucket: info.bucket,
            object_name: None,
            robot_id: info.robot_id,
            deploy_path: info.deploy_path,
            robot_type: None,
            robot_version: None,
            file_metadata: info.file_metadata,
        });
    }

    if file_list.is_empty() {
        return;
    }

    let info_json = match serde_json::to_string(&FileCreateList { file_list }) {
        Ok(info_json) => info_json,
        Err(error) => {
            warn!(
                error = &error as &dyn std::error::Error,
                "failed to serialize upload info"
            );
            return;
        }
    };

    wait_until_healthy(client, base_url).await;

    let mut form = Form::new().text("file_info_list", info_json);
    for part in parts {
        form = form.part("files", part);
    }

    let request = client
        .post(format!("{base_url}/file/upload"))
        .multipart(form)
        .timeout(UPLOAD_TIMEOUT);

    match request.send().await {
        Ok(response) => info!(status = %response.status(), "file upload finished"),
        Err(error) => warn!(
            error = &error as &dyn std::error::Error,
            "file upload failed"
        ),
    }
}

/// Blocks until the cloud service health endpoint answers 200.
async fn wait_until_healthy(client: &Client, base_url: &str) {
    loop {
        match client
            .get(format!("{base_url}/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => return,
            Ok(response) => {
                warn!(status = %response.status(), "cloud service is not available");
            }
            Err(error) => {
                warn!(
                    error = &error as &dyn std::error::Error,
                    "cloud service is not available"
                );
            }
        }

        time::sleep(UPLOAD_RETRY_PERIOD).await;
    }
}
