use std::path::Path;
use std::sync::Arc;

use ota_common::deploy::DeployMessage;
use ota_common::storage::ObjectStore;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::error::Error;
use crate::jobs::JobMap;

/// Single consumer of the deploy queue, so files are installed strictly in
/// the order their jobs were first received.
pub async fn task(
    mut recv: mpsc::Receiver<DeployMessage>,
    jobs: JobMap,
    store: Arc<dyn ObjectStore>,
) {
    info!("deploy worker started");

    while let Some(job) = recv.recv().await {
        match install(&job, store.as_ref()).await {
            Ok(()) => {
                info!(job_id = %job.job_id, deploy_path = job.deploy_path.as_str(), "file deployed");
                jobs.complete(job.job_id);
            }
            Err(error) => {
                error!(
                    job_id = %job.job_id,
                    error = &error as &dyn std::error::Error,
                    "deploy failed"
                );
                // No retry here; the cloud resubmits by creating a new job.
                jobs.fail(job.job_id, error.to_string());
            }
        }
    }
}

async fn install(job: &DeployMessage, store: &dyn ObjectStore) -> Result<(), Error> {
    if let Some(parent) = Path::new(&job.deploy_path).parent() {
        fs::create_dir_all(parent).await?;
    }

    let data = store.download(&job.bucket, &job.object_name).await?;
    fs::write(&job.deploy_path, &data).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use ota_common::deploy::JobStatus;
    use ota_common::storage::StorageError;
    use uuid::Uuid;

    use super::*;

    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<HashMap<(String, String), Bytes>>,
    }

    impl MemoryStore {
        fn with_object(bucket: &str, object_name: &str, data: &'static [u8]) -> Self {
            let store = Self::default();
            store.objects.lock().unwrap().insert(
                (bucket.to_string(), object_name.to_string()),
                Bytes::from_static(data),
            );
            store
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn upload(
            &self,
            bucket: &str,
            object_name: &str,
            data: Bytes,
        ) -> Result<(), StorageError> {
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), object_name.to_string()), data);
            Ok(())
        }

        async fn download(&self, bucket: &str, object_name: &str) -> Result<Bytes, StorageError> {
            self.objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), object_name.to_string()))
                .cloned()
                .ok_or_else(|| {
                    StorageError::Io(io::Error::new(io::ErrorKind::NotFound, "no such object"))
                })
        }

        async fn delete(&self, bucket: &str, object_name: &str) -> Result<(), StorageError> {
            self.objects
                .lock()
                .unwrap()
                .remove(&(bucket.to_string(), object_name.to_string()));
            Ok(())
        }
    }

    fn job(deploy_path: &Path) -> DeployMessage {
        DeployMessage {
            job_id: Uuid::new_v4(),
            bucket: "files".to_string(),
            object_name: "map.pgm_1".to_string(),
            deploy_path: deploy_path.to_string_lossy().into_owned(),
        }
    }

    #[tokio::test]
    async fn install_creates_parent_directories_and_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let deploy_path = dir.path().join("nested/deep/map.pgm");
        let store = MemoryStore::with_object("files", "map.pgm_1", b"map-bytes");

        install(&job(&deploy_path), &store).await.unwrap();

        assert_eq!(std::fs::read(&deploy_path).unwrap(), b"map-bytes");
    }

    #[tokio::test]
    async fn worker_marks_jobs_completed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_object("files", "map.pgm_1", b"map-bytes");
        let jobs = JobMap::default();
        let (send, recv) = mpsc::channel(8);

        let worker = tokio::spawn(task(recv, jobs.clone(), Arc::new(store)));

        let first = job(&dir.path().join("a.pgm"));
        let second = job(&dir.path().join("b.pgm"));
        jobs.insert_received(first.job_id);
        jobs.insert_received(second.job_id);
        send.send(first.clone()).await.unwrap();
        send.send(second.clone()).await.unwrap();
        drop(send);
        worker.await.unwrap();

        let snapshot = jobs.snapshot();
        assert_eq!(
            snapshot.get(&first.job_id).unwrap().status,
            JobStatus::Completed
        );
        assert_eq!(
            snapshot.get(&second.job_id).unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn missing_objects_mark_the_job_failed() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = JobMap::default();
        let (send, recv) = mpsc::channel(8);

        let worker = tokio::spawn(task(recv, jobs.clone(), Arc::new(MemoryStore::default())));

        let lost = job(&dir.path().join("missing.pgm"));
        jobs.insert_received(lost.job_id);
        send.send(lost.clone()).await.unwrap();
        drop(send);
        worker.await.unwrap();

        let state = jobs.snapshot().remove(&lost.job_id).unwrap();
        assert_eq!(state.status, JobStatus::Failed);
        assert!(!state.error_msg.unwrap().is_empty());
    }
}
