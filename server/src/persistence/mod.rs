mod artifact;
mod error;
mod job;
mod target;

pub use artifact::{Artifact, ArtifactFilter, ArtifactUpdate, Fingerprint};
pub use error::Error as PersistenceError;
pub use error::Result;
pub use job::DeployJob;
pub use target::DeployTarget;

use std::path::Path;

use chrono::{DateTime, Utc};
use ota_common::deploy::JobStatus;
use ota_common::models::FileCreate;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::types::Json;
use sqlx::QueryBuilder;
use uuid::Uuid;

/// Creates a persistent storage solution (i.e., SQL database). New
/// connections should be made by cloning [`Persistence`] rather than
/// repeatedly calling [`Persistence::new`].
#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    pub async fn new(path: &Path) -> Self {
        let url = format!("sqlite://{}", path.display());

        if !path.exists() {
            Sqlite::create_database(&url).await.unwrap();
        }

        let pool = SqlitePool::connect(&url).await.unwrap();
        Self::from_pool(pool).await
    }

    #[cfg(test)]
    pub(crate) async fn new_in_memory() -> Self {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Self {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS files (
                bucket TEXT NOT NULL,        -- Bucket holding the object.
                object_name TEXT NOT NULL,   -- Object key within the bucket.
                file_name TEXT,              -- Name the file was uploaded under.
                timestamp TEXT NOT NULL,     -- Last upload or update, timezone-aware.
                robot_id TEXT,
                robot_type TEXT,
                robot_version TEXT,
                deploy_path TEXT,            -- Default install path on the robot.
                sha256 TEXT NOT NULL,        -- Hash of the bytes currently stored.
                file_metadata TEXT NOT NULL, -- JSON document, canonically ordered keys.
                valid BOOLEAN NOT NULL DEFAULT TRUE,
                PRIMARY KEY (bucket, object_name)
            );

            CREATE TABLE IF NOT EXISTS deploy_target (
                robot_id TEXT NOT NULL,
                deploy_path TEXT NOT NULL,
                bucket TEXT NOT NULL,
                object_name TEXT NOT NULL,
                PRIMARY KEY (robot_id, deploy_path),
                FOREIGN KEY (bucket, object_name)
                    REFERENCES files (bucket, object_name)
                    ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS deploy_jobs (
                job_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,        -- PENDING | RECEIVED | COMPLETED | FAILED
                robot_id TEXT NOT NULL,
                deploy_path TEXT NOT NULL,
                deploy_msg TEXT NOT NULL,    -- Published payload, verbatim.
                timestamp TEXT NOT NULL,
                error_msg TEXT
            );
            ",
        )
        .execute(&pool)
        .await
        .unwrap();

        Self { pool }
    }

    // artifacts

    pub async fn get_artifact(
        &self,
        bucket: &str,
        object_name: &str,
    ) -> Result<Option<Artifact>> {
        sqlx::query_as("SELECT * FROM files WHERE bucket = ? AND object_name = ?")
            .bind(bucket)
            .bind(object_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    pub async fn get_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<Artifact>> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM files WHERE 1 = 1");

        if let Some(bucket) = &filter.bucket {
            query.push(" AND bucket = ").push_bind(bucket);
        }
        if let Some(object_name) = &filter.object_name {
            query.push(" AND object_name = ").push_bind(object_name);
        }
        if let Some(robot_id) = &filter.robot_id {
            query.push(" AND robot_id = ").push_bind(robot_id);
        }
        if let Some(robot_type) = &filter.robot_type {
            query.push(" AND robot_type = ").push_bind(robot_type);
        }
        if let Some(deploy_path) = &filter.deploy_path {
            query.push(" AND deploy_path = ").push_bind(deploy_path);
        }
        for (key, value) in &filter.file_metadata {
            query
                .push(" AND json_extract(file_metadata, ")
                .push_bind(format!("$.{key}"))
                .push(") = ")
                .push_bind(value);
        }

        query.push(" ORDER BY timestamp DESC");

        query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// Newest artifact matching the full dedup fingerprint, if any. `IS`
    /// comparisons keep absent attributes matching absent columns.
    pub async fn find_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>> {
        let metadata = serde_json::to_string(&fingerprint.file_metadata)
            .expect("string map serializes to json");

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM files WHERE bucket = ");
        query.push_bind(&fingerprint.bucket);
        query.push(" AND sha256 = ").push_bind(&fingerprint.sha256);
        query
            .push(" AND robot_id IS ")
            .push_bind(fingerprint.robot_id.as_deref());
        query
            .push(" AND deploy_path IS ")
            .push_bind(fingerprint.deploy_path.as_deref());
        query
            .push(" AND robot_type IS ")
            .push_bind(fingerprint.robot_type.as_deref());
        query
            .push(" AND robot_version IS ")
            .push_bind(fingerprint.robot_version.as_deref());
        query.push(" AND file_metadata = ").push_bind(metadata);

        if let Some(object_name) = &fingerprint.object_name {
            query.push(" AND object_name = ").push_bind(object_name);
        }

        query.push(" ORDER BY timestamp DESC");

        query
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    pub async fn create_artifact(
        &self,
        object_name: &str,
        info: &FileCreate,
        file_name: Option<&str>,
        sha256: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Artifact> {
        let artifact = Artifact {
            bucket: info.bucket.clone(),
            object_name: object_name.to_string(),
            file_name: file_name.map(str::to_string),
            timestamp,
            robot_id: info.robot_id.clone(),
            robot_type: info.robot_type.clone(),
            robot_version: info.robot_version.clone(),
            deploy_path: info.deploy_path.clone(),
            sha256: sha256.to_string(),
            file_metadata: Json(info.file_metadata.clone()),
            valid: true,
        };

        sqlx::query(
            "INSERT INTO files (bucket, object_name, file_name, timestamp, robot_id, robot_type, robot_version, deploy_path, sha256, file_metadata, valid)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&artifact.bucket)
        .bind(&artifact.object_name)
        .bind(&artifact.file_name)
        .bind(artifact.timestamp)
        .bind(&artifact.robot_id)
        .bind(&artifact.robot_type)
        .bind(&artifact.robot_version)
        .bind(&artifact.deploy_path)
        .bind(&artifact.sha256)
        .bind(&artifact.file_metadata)
        .bind(artifact.valid)
        .execute(&self.pool)
        .await?;

        Ok(artifact)
    }

    pub async fn update_artifact(
        &self,
        bucket: &str,
        object_name: &str,
        update: &ArtifactUpdate,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE files SET timestamp = ");
        query.push_bind(timestamp);

        if let Some(robot_id) = &update.robot_id {
            query.push(", robot_id = ").push_bind(robot_id);
        }
        if let Some(robot_type) = &update.robot_type {
            query.push(", robot_type = ").push_bind(robot_type);
        }
        if let Some(robot_version) = &update.robot_version {
            query.push(", robot_version = ").push_bind(robot_version);
        }
        if let Some(deploy_path) = &update.deploy_path {
            query.push(", deploy_path = ").push_bind(deploy_path);
        }
        if let Some(file_metadata) = &update.file_metadata {
            query
                .push(", file_metadata = ")
                .push_bind(Json(file_metadata.clone()));
        }
        if let Some(file_name) = &update.file_name {
            query.push(", file_name = ").push_bind(file_name);
        }
        if let Some(sha256) = &update.sha256 {
            query.push(", sha256 = ").push_bind(sha256);
        }
        if let Some(valid) = update.valid {
            query.push(", valid = ").push_bind(valid);
        }

        query.push(" WHERE bucket = ").push_bind(bucket);
        query.push(" AND object_name = ").push_bind(object_name);

        let result = query.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound.into());
        }

        Ok(())
    }

    /// Deletes the row; referencing deploy_target rows go with it via the
    /// schema-level cascade.
    pub async fn delete_artifact(&self, bucket: &str, object_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE bucket = ? AND object_name = ?")
            .bind(bucket)
            .bind(object_name)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    // deploy jobs

    pub async fn create_job(
        &self,
        job_id: Uuid,
        robot_id: &str,
        deploy_path: &str,
        deploy_msg: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO deploy_jobs (job_id, status, robot_id, deploy_path, deploy_msg, timestamp)
                VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(JobStatus::Pending)
        .bind(robot_id)
        .bind(deploy_path)
        .bind(deploy_msg)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Into::into)
    }

    /// The only transition primitive; safe to apply repeatedly with the same
    /// value. An earlier error message survives transitions that carry none.
    pub async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_msg: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE deploy_jobs SET status = ?, error_msg = COALESCE(?, error_msg) WHERE job_id = ?",
        )
        .bind(status)
        .bind(error_msg)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::UnknownJob(job_id));
        }

        Ok(())
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<DeployJob>> {
        sqlx::query_as("SELECT * FROM deploy_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// Jobs the cloud still considers in flight, oldest first. This set is
    /// the input to the resend policy.
    pub async fn get_running_jobs(&self, robot_id: &str) -> Result<Vec<DeployJob>> {
        sqlx::query_as(
            "SELECT * FROM deploy_jobs
                WHERE robot_id = ? AND status != ? AND status != ?
                ORDER BY timestamp ASC",
        )
        .bind(robot_id)
        .bind(JobStatus::Completed)
        .bind(JobStatus::Failed)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    // deploy targets

    pub async fn upsert_deploy_target(
        &self,
        robot_id: &str,
        deploy_path: &str,
        bucket: &str,
        object_name: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO deploy_target (robot_id, deploy_path, bucket, object_name)
                VALUES (?, ?, ?, ?)",
        )
        .bind(robot_id)
        .bind(deploy_path)
        .bind(bucket)
        .bind(object_name)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Into::into)
    }

    pub async fn get_deploy_targets(&self, robot_id: &str) -> Result<Vec<DeployTarget>> {
        sqlx::query_as("SELECT * FROM deploy_target WHERE robot_id = ?")
            .bind(robot_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;

    use super::*;

    fn info(robot_id: Option<&str>, deploy_path: Option<&str>) -> FileCreate {
        FileCreate {
            robot_id: robot_id.map(str::to_string),
            deploy_path: deploy_path.map(str::to_string),
            ..Default::default()
        }
    }

    fn metadata(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn artifact_create_and_fetch() {
        let p = Persistence::new_in_memory().await;
        let timestamp = Utc.with_ymd_and_hms(2024, 4, 25, 4, 43, 33).unwrap();

        let created = p
            .create_artifact(
                "map.pgm_1",
                &FileCreate {
                    robot_id: Some("robot_a".to_string()),
                    file_metadata: metadata(&[("type", "map")]),
                    ..Default::default()
                },
                Some("map.pgm"),
                "abc123",
                timestamp,
            )
            .await
            .unwrap();

        let fetched = p.get_artifact("files", "map.pgm_1").await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert!(fetched.valid);
        assert_eq!(fetched.timestamp, timestamp);
        assert!(p.get_artifact("files", "other").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn artifact_filters_and_ordering() {
        let p = Persistence::new_in_memory().await;

        for (object_name, robot_id, meta, hour) in [
            ("a", Some("robot_a"), metadata(&[("type", "map")]), 1),
            ("b", Some("robot_a"), metadata(&[("type", "config")]), 3),
            ("c", Some("robot_b"), metadata(&[("type", "map")]), 2),
        ] {
            p.create_artifact(
                object_name,
                &FileCreate {
                    robot_id: robot_id.map(str::to_string),
                    file_metadata: meta,
                    ..Default::default()
                },
                None,
                "hash",
                Utc.with_ymd_and_hms(2024, 4, 25, hour, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        }

        // Newest first, no filters.
        let all = p.get_artifacts(&ArtifactFilter::default()).await.unwrap();
        let names: Vec<_> = all.iter().map(|a| a.object_name.as_str()).collect();
        assert_eq!(names, ["b", "c", "a"]);

        let robot_a = p
            .get_artifacts(&ArtifactFilter {
                robot_id: Some("robot_a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(robot_a.len(), 2);

        let maps = p
            .get_artifacts(&ArtifactFilter {
                file_metadata: metadata(&[("type", "map")]),
                ..Default::default()
            })
            .await
            .unwrap();
        let names: Vec<_> = maps.iter().map(|a| a.object_name.as_str()).collect();
        assert_eq!(names, ["c", "a"]);

        let none = p
            .get_artifacts(&ArtifactFilter {
                file_metadata: metadata(&[("type", "map"), ("area", "dock")]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fingerprint_matches_content_and_metadata() {
        let p = Persistence::new_in_memory().await;

        let info = FileCreate {
            robot_id: Some("robot_a".to_string()),
            deploy_path: Some("/tmp/map.pgm".to_string()),
            file_metadata: metadata(&[("type", "map")]),
            ..Default::default()
        };
        p.create_artifact("map.pgm_1", &info, Some("map.pgm"), "hash1", Utc::now())
            .await
            .unwrap();

        let mut fingerprint = Fingerprint {
            bucket: "files".to_string(),
            sha256: "hash1".to_string(),
            robot_id: Some("robot_a".to_string()),
            deploy_path: Some("/tmp/map.pgm".to_string()),
            robot_type: None,
            robot_version: None,
            file_metadata: metadata(&[("type", "map")]),
            object_name: None,
        };

        let hit = p.find_fingerprint(&fingerprint).await.unwrap().unwrap();
        assert_eq!(hit.object_name, "map.pgm_1");

        // Different metadata is a different artifact.
        fingerprint.file_metadata = metadata(&[("type", "config")]);
        assert!(p.find_fingerprint(&fingerprint).await.unwrap().is_none());

        // A caller-supplied object name restricts the match.
        fingerprint.file_metadata = metadata(&[("type", "map")]);
        fingerprint.object_name = Some("somewhere_else".to_string());
        assert!(p.find_fingerprint(&fingerprint).await.unwrap().is_none());

        // Absent attributes only match absent columns.
        fingerprint.object_name = None;
        fingerprint.robot_id = None;
        assert!(p.find_fingerprint(&fingerprint).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn artifact_partial_update() {
        let p = Persistence::new_in_memory().await;
        let created_at = Utc.with_ymd_and_hms(2024, 4, 25, 4, 0, 0).unwrap();
        let updated_at = Utc.with_ymd_and_hms(2024, 4, 26, 4, 0, 0).unwrap();

        p.create_artifact(
            "config.yaml_1",
            &info(Some("robot_a"), None),
            Some("config.yaml"),
            "hash1",
            created_at,
        )
        .await
        .unwrap();

        p.update_artifact(
            "files",
            "config.yaml_1",
            &ArtifactUpdate {
                robot_type: Some("amr".to_string()),
                ..Default::default()
            },
            updated_at,
        )
        .await
        .unwrap();

        let updated = p
            .get_artifact("files", "config.yaml_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.robot_type.as_deref(), Some("amr"));
        assert_eq!(updated.robot_id.as_deref(), Some("robot_a"));
        // Untouched unless provided.
        assert_eq!(updated.sha256, "hash1");
        assert!(updated.valid);
        assert_eq!(updated.timestamp, updated_at);

        p.update_artifact(
            "files",
            "config.yaml_1",
            &ArtifactUpdate {
                valid: Some(false),
                ..Default::default()
            },
            Utc::now(),
        )
        .await
        .unwrap();
        let invalidated = p
            .get_artifact("files", "config.yaml_1")
            .await
            .unwrap()
            .unwrap();
        assert!(!invalidated.valid);

        let missing = p
            .update_artifact("files", "nope", &ArtifactUpdate::default(), Utc::now())
            .await;
        assert!(missing.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleting_an_artifact_cascades_to_targets() {
        let p = Persistence::new_in_memory().await;

        p.create_artifact("map.pgm_1", &info(Some("robot_a"), None), None, "hash", Utc::now())
            .await
            .unwrap();
        p.upsert_deploy_target("robot_a", "/maps/map.pgm", "files", "map.pgm_1")
            .await
            .unwrap();
        assert_eq!(p.get_deploy_targets("robot_a").await.unwrap().len(), 1);

        p.delete_artifact("files", "map.pgm_1").await.unwrap();

        assert!(p.get_artifact("files", "map.pgm_1").await.unwrap().is_none());
        assert!(p.get_deploy_targets("robot_a").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn job_lifecycle_and_idempotent_updates() {
        let p = Persistence::new_in_memory().await;
        let job_id = Uuid::new_v4();

        p.create_job(job_id, "robot_a", "/tmp/test.txt", "{\"job\":\"msg\"}")
            .await
            .unwrap();

        let job = p.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.deploy_msg, "{\"job\":\"msg\"}");

        p.update_job_status(job_id, JobStatus::Failed, Some("disk full"))
            .await
            .unwrap();
        // Re-applying the same transition changes nothing.
        p.update_job_status(job_id, JobStatus::Failed, Some("disk full"))
            .await
            .unwrap();

        let job = p.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_msg.as_deref(), Some("disk full"));

        // A later update without a message keeps the recorded one.
        p.update_job_status(job_id, JobStatus::Failed, None)
            .await
            .unwrap();
        let job = p.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.error_msg.as_deref(), Some("disk full"));

        let unknown = p
            .update_job_status(Uuid::new_v4(), JobStatus::Completed, None)
            .await;
        assert!(matches!(unknown, Err(PersistenceError::UnknownJob(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn running_jobs_exclude_terminal_states() {
        let p = Persistence::new_in_memory().await;

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let done = Uuid::new_v4();
        let other_robot = Uuid::new_v4();

        for job_id in [first, second, done] {
            p.create_job(job_id, "robot_a", "/tmp/f", "{}").await.unwrap();
        }
        p.create_job(other_robot, "robot_b", "/tmp/f", "{}")
            .await
            .unwrap();

        p.update_job_status(second, JobStatus::Received, None)
            .await
            .unwrap();
        p.update_job_status(done, JobStatus::Completed, None)
            .await
            .unwrap();

        let running = p.get_running_jobs("robot_a").await.unwrap();
        let ids: Vec<_> = running.iter().map(|job| job.job_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first));
        assert!(ids.contains(&second));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deploy_target_upsert_keeps_one_row_per_path() {
        let p = Persistence::new_in_memory().await;

        p.create_artifact("v1", &info(None, None), None, "hash1", Utc::now())
            .await
            .unwrap();
        p.create_artifact("v2", &info(None, None), None, "hash2", Utc::now())
            .await
            .unwrap();

        p.upsert_deploy_target("robot_a", "/etc/config", "files", "v1")
            .await
            .unwrap();
        p.upsert_deploy_target("robot_a", "/etc/config", "files", "v2")
            .await
            .unwrap();

        let targets = p.get_deploy_targets("robot_a").await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].object_name, "v2");
    }
}
