//! src/services/local_store.rs
//!
//! LocalStorage, a project-scoped object store backed by SQLite for metadata
//! and local disk for payloads sharded beneath
//! `project_root/buckets/{bucket}/{shard}/{shard}/{payload_id}`.
//!
//! Uploads are two-phase. Bytes go to a hidden temp file next to the final
//! location; `commit` fsyncs, renames it to a payload path of its own and only
//! then upserts the object row to point at it. An object without a row is
//! invisible to `list_objects`, so an aborted or dropped upload never becomes
//! readable, and a failed re-commit leaves the previous payload and row as
//! they were. The replaced payload is removed after the row moves on.

use crate::{
    models::{
        bucket::Bucket,
        metadata::{CustomMetadata, ObjectMetadata},
        object::Object,
    },
    services::storage::{
        ByteSink, CommitInfo, CredentialError, ObjectStorage, Project, StorageError,
        StorageResult, UploadSink, cancellable,
    },
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use md5::Context;
use serde::{Deserialize, Serialize};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const GRANT_VERSION: u32 = 1;
const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

/// Decoded access grant for a local project.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AccessGrant {
    pub version: u32,
    pub project_root: PathBuf,
}

impl AccessGrant {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            version: GRANT_VERSION,
            project_root: project_root.into(),
        }
    }

    /// Serialize into the opaque string form accepted by `parse`.
    pub fn encode(&self) -> String {
        // serializing a struct of a u32 and a path cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn parse(grant: &str) -> Result<Self, CredentialError> {
        let raw = URL_SAFE_NO_PAD
            .decode(grant.trim())
            .map_err(|_| CredentialError::Encoding)?;
        let access: AccessGrant =
            serde_json::from_slice(&raw).map_err(|err| CredentialError::Malformed(err.to_string()))?;
        if access.version != GRANT_VERSION {
            return Err(CredentialError::UnsupportedVersion(access.version));
        }
        if access.project_root.as_os_str().is_empty() {
            return Err(CredentialError::EmptyProject);
        }
        Ok(access)
    }
}

/// Storage client handing out [`LocalProject`]s.
#[derive(Clone, Debug, Default)]
pub struct LocalStorage;

#[async_trait]
impl ObjectStorage for LocalStorage {
    type Access = AccessGrant;

    fn parse_credential(&self, grant: &str) -> Result<AccessGrant, CredentialError> {
        AccessGrant::parse(grant)
    }

    async fn open_project(
        &self,
        access: &AccessGrant,
        cancel: &CancellationToken,
    ) -> StorageResult<Box<dyn Project>> {
        let project = cancellable(cancel, LocalProject::open(&access.project_root)).await?;
        Ok(Box::new(project))
    }
}

/// One project: a SQLite metadata database plus a payload directory tree.
#[derive(Clone)]
pub struct LocalProject {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl LocalProject {
    /// Open (creating if needed) the project rooted at `root` and apply the
    /// schema.
    pub async fn open(root: &Path) -> StorageResult<Self> {
        let meta_dir = root.join("meta");
        fs::create_dir_all(&meta_dir).await?;

        let options = SqliteConnectOptions::new()
            .filename(meta_dir.join("project.db"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let project = Self {
            db: Arc::new(pool),
            base_path: root.to_path_buf(),
        };
        project.run_migrations().await?;
        debug!("opened project at {}", root.display());
        Ok(project)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        let statements = MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty());

        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(key: &str) -> StorageResult<()> {
        let invalid = || StorageError::InvalidObjectKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key.starts_with('/') || key.ends_with('/') || key.contains("..") {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }

        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }

        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }

        Ok(())
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join("buckets").join(bucket_name)
    }

    /// Two-level shard identifiers from MD5(bucket/key).
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// `base_path/buckets/bucket/{shard}/{shard}/{payload_id}`; parents may not exist yet.
    pub fn object_path(&self, bucket_name: &str, key: &str, payload_id: Uuid) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(payload_id.simple().to_string());
        path
    }

    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        Self::ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<_, Bucket>("SELECT id, name, created_at FROM buckets WHERE name = ?")
            .bind(bucket)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
                other => StorageError::Sqlx(other),
            })
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket_id, key, size_bytes, etag, payload_id, last_modified
             FROM objects WHERE bucket_id = ? AND key = ?",
        )
        .bind(bucket_rec.id)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::InvalidObjectKey(key.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Idempotent create-if-absent.
    pub async fn create_bucket_if_absent(&self, name: &str) -> StorageResult<()> {
        Self::ensure_bucket_name_safe(name)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        let inserted = sqlx::query(
            "INSERT INTO buckets (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        if inserted.rows_affected() > 0 {
            debug!("created bucket {}", name);
        }
        Ok(())
    }

    /// Committed objects in `bucket`, ordered by key.
    pub async fn list_objects(&self, bucket: &str) -> StorageResult<Vec<Object>> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let rows = sqlx::query_as::<_, Object>(
            "SELECT id, bucket_id, key, size_bytes, etag, payload_id, last_modified
             FROM objects WHERE bucket_id = ? ORDER BY key ASC",
        )
        .bind(bucket_rec.id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// A committed object's record and custom metadata.
    pub async fn object_metadata(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Object, CustomMetadata)> {
        let object = self.fetch_object(bucket, key).await?;
        let rows = sqlx::query_as::<_, ObjectMetadata>(
            "SELECT object_id, key, value FROM object_metadata WHERE object_id = ?",
        )
        .bind(object.id)
        .fetch_all(&*self.db)
        .await?;

        let metadata = rows.into_iter().map(|row| (row.key, row.value)).collect();
        Ok((object, metadata))
    }

    /// Read a committed object's payload.
    pub async fn read_object(&self, bucket: &str, key: &str) -> StorageResult<Vec<u8>> {
        let object = self.fetch_object(bucket, key).await?;
        let path = self.object_path(bucket, &object.key, object.payload_id);
        Ok(fs::read(path).await?)
    }

    async fn begin_upload(&self, bucket: &str, key: &str) -> StorageResult<LocalUpload> {
        let bucket_rec = self.fetch_bucket(bucket).await?;

        // an empty key lets the store choose the object name
        let key = if key.is_empty() {
            format!("upload-{}", Uuid::new_v4())
        } else {
            key.to_string()
        };
        Self::ensure_key_safe(&key)?;

        let payload_id = Uuid::new_v4();
        let final_path = self.object_path(&bucket_rec.name, &key, payload_id);
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", payload_id.simple()));

        // no await between creating the temp file and handing it to its guard
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        debug!("opened upload {} -> {}", key, tmp_path.display());

        Ok(LocalUpload {
            db: self.db.clone(),
            bucket: bucket_rec,
            key,
            payload_id,
            owned: Some(tmp_path.clone()),
            tmp_path,
            final_path,
            file: Some(File::from_std(file)),
            size_bytes: 0,
            digest: Context::new(),
            metadata: CustomMetadata::new(),
        })
    }
}

#[async_trait]
impl Project for LocalProject {
    async fn ensure_bucket(&self, bucket: &str, cancel: &CancellationToken) -> StorageResult<()> {
        cancellable(cancel, self.create_bucket_if_absent(bucket)).await
    }

    async fn open_upload(&self, bucket: &str, key: &str) -> StorageResult<Box<dyn UploadSink>> {
        Ok(Box::new(self.begin_upload(bucket, key).await?))
    }
}

/// An in-progress upload. Nothing is visible until `commit`.
pub struct LocalUpload {
    db: Arc<SqlitePool>,
    bucket: Bucket,
    key: String,
    payload_id: Uuid,
    tmp_path: PathBuf,
    final_path: PathBuf,
    /// Payload file this upload still owns; removed on drop. Cleared once a
    /// committed row points at it.
    owned: Option<PathBuf>,
    file: Option<File>,
    size_bytes: u64,
    digest: Context,
    metadata: CustomMetadata,
}

impl LocalUpload {
    fn file(&mut self) -> StorageResult<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| StorageError::Backend("upload is no longer open".into()))
    }

    /// Move the finished temp file to this upload's own payload path. No row
    /// references that path until `record` succeeds.
    async fn publish(&mut self) -> StorageResult<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| StorageError::Backend("upload is no longer open".into()))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&self.tmp_path, &self.final_path).await?;
        self.owned = Some(self.final_path.clone());
        Ok(())
    }

    /// Upsert the object row and replace its metadata in one transaction.
    /// Returns the row and the payload id it pointed at before, if any.
    async fn record(&self, etag: &str) -> Result<(Object, Option<Uuid>), sqlx::Error> {
        let mut tx = self.db.begin().await?;

        let previous = sqlx::query_scalar::<_, Uuid>(
            "SELECT payload_id FROM objects WHERE bucket_id = ? AND key = ?",
        )
        .bind(self.bucket.id)
        .bind(&self.key)
        .fetch_optional(&mut *tx)
        .await?;

        let object = sqlx::query_as::<_, Object>(
            r#"
            INSERT INTO objects (id, bucket_id, key, size_bytes, etag, payload_id, last_modified)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                payload_id = excluded.payload_id,
                last_modified = excluded.last_modified
            RETURNING id, bucket_id, key, size_bytes, etag, payload_id, last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(self.bucket.id)
        .bind(&self.key)
        .bind(self.size_bytes as i64)
        .bind(etag)
        .bind(self.payload_id)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object.id)
            .execute(&mut *tx)
            .await?;

        for (key, value) in &self.metadata {
            sqlx::query("INSERT INTO object_metadata (object_id, key, value) VALUES (?, ?, ?)")
                .bind(object.id)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok((object, previous))
    }
}

#[async_trait]
impl ByteSink for LocalUpload {
    async fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
        self.file()?.write_all(buf).await?;
        self.digest.consume(buf);
        self.size_bytes += buf.len() as u64;
        Ok(buf.len())
    }
}

#[async_trait]
impl UploadSink for LocalUpload {
    async fn set_metadata(&mut self, metadata: CustomMetadata) -> StorageResult<()> {
        self.file()?;
        self.metadata = metadata;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StorageResult<CommitInfo> {
        let mut this = self;

        // on any failure `this` drops and removes the file it still owns,
        // which is never the payload of an already committed object
        this.publish().await?;
        let etag = format!("{:x}", this.digest.clone().compute());
        let (object, previous) = this.record(&etag).await?;
        this.owned = None;

        // no await once the row is committed
        if let Some(previous) = previous.filter(|id| *id != this.payload_id) {
            let stale = this
                .final_path
                .with_file_name(previous.simple().to_string());
            if let Err(err) = std::fs::remove_file(&stale) {
                if err.kind() != ErrorKind::NotFound {
                    warn!("failed to remove replaced payload {}: {}", stale.display(), err);
                }
            }
        }

        debug!(
            "committed {}/{} ({} bytes, etag {})",
            this.bucket.name, object.key, object.size_bytes, object.etag
        );
        Ok(CommitInfo {
            key: object.key,
            size: this.size_bytes,
            etag: Some(object.etag),
        })
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        let mut this = self;
        this.file.take();
        if let Some(path) = this.owned.take() {
            match fs::remove_file(&path).await {
                Ok(()) => debug!("aborted upload {}", this.key),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
        }
        Ok(())
    }
}

impl Drop for LocalUpload {
    fn drop(&mut self) {
        self.file.take();
        if let Some(path) = self.owned.take() {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != ErrorKind::NotFound {
                    debug!("failed to remove {}: {}", path.display(), err);
                }
            }
        }
    }
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Poll;
    use tempfile::TempDir;

    async fn project() -> (TempDir, LocalProject) {
        let dir = TempDir::new().unwrap();
        let project = LocalProject::open(dir.path()).await.unwrap();
        (dir, project)
    }

    fn files_under(dir: &Path, temp: bool) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in std::fs::read_dir(&current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else if path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with(".tmp-") == temp)
                {
                    found.push(path);
                }
            }
        }
        found
    }

    fn temp_files(dir: &Path) -> Vec<PathBuf> {
        files_under(dir, true)
    }

    fn payload_files(dir: &Path) -> Vec<PathBuf> {
        files_under(&dir.join("buckets"), false)
    }

    async fn commit_bytes(project: &LocalProject, key: &str, data: &[u8], title: &str) {
        let mut upload = project.open_upload("videos", key).await.unwrap();
        upload.write(data).await.unwrap();
        upload
            .set_metadata(CustomMetadata::from([("OriginalTitle".into(), title.into())]))
            .await
            .unwrap();
        upload.commit().await.unwrap();
    }

    #[test]
    fn grant_round_trips() {
        let grant = AccessGrant::new("/srv/projects/videos");
        let parsed = AccessGrant::parse(&grant.encode()).unwrap();
        assert_eq!(parsed, grant);
    }

    #[test]
    fn grant_rejects_garbage() {
        assert_eq!(AccessGrant::parse("not base64!"), Err(CredentialError::Encoding));
        let not_json = URL_SAFE_NO_PAD.encode(b"hello");
        assert!(matches!(
            AccessGrant::parse(&not_json),
            Err(CredentialError::Malformed(_))
        ));
        let future = URL_SAFE_NO_PAD.encode(br#"{"version":9,"project_root":"/x"}"#);
        assert_eq!(
            AccessGrant::parse(&future),
            Err(CredentialError::UnsupportedVersion(9))
        );
        let empty = URL_SAFE_NO_PAD.encode(br#"{"version":1,"project_root":""}"#);
        assert_eq!(AccessGrant::parse(&empty), Err(CredentialError::EmptyProject));
    }

    #[test]
    fn bucket_names_follow_s3_rules() {
        for ok in ["videos", "my-bucket.2023", "abc"] {
            assert!(LocalProject::ensure_bucket_name_safe(ok).is_ok(), "{ok}");
        }
        for bad in ["ab", "Videos", "-videos", "videos.", "a..b", "a.-b", "192.168.0.1", "has space"] {
            assert!(LocalProject::ensure_bucket_name_safe(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn keys_reject_traversal() {
        assert!(LocalProject::ensure_key_safe("talks/intro.mp4").is_ok());
        for bad in ["", "/abs", "a/../b", "dir/", "tab\there"] {
            assert!(LocalProject::ensure_key_safe(bad).is_err(), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn ensure_bucket_is_idempotent() {
        let (_dir, project) = project().await;
        let cancel = CancellationToken::new();
        project.ensure_bucket("videos", &cancel).await.unwrap();
        project.ensure_bucket("videos", &cancel).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buckets")
            .fetch_one(&*project.db)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(project.list_objects("videos").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_bucket_is_rejected_at_ensure() {
        let (_dir, project) = project().await;
        let err = project
            .ensure_bucket("Not_Valid", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidBucketName { .. }));
    }

    #[tokio::test]
    async fn upload_to_missing_bucket_fails() {
        let (_dir, project) = project().await;
        let err = project.open_upload("nowhere", "k").await.err().unwrap();
        assert!(matches!(err, StorageError::BucketNotFound(name) if name == "nowhere"));
    }

    #[tokio::test]
    async fn object_is_invisible_until_commit() {
        let (dir, project) = project().await;
        project
            .ensure_bucket("videos", &CancellationToken::new())
            .await
            .unwrap();

        let mut upload = project.open_upload("videos", "talks/intro.mp4").await.unwrap();
        upload.write(b"hello ").await.unwrap();
        upload.write(b"world").await.unwrap();
        upload
            .set_metadata(CustomMetadata::from([("Author".into(), "A".into())]))
            .await
            .unwrap();
        assert!(project.list_objects("videos").await.unwrap().is_empty());
        assert_eq!(temp_files(dir.path()).len(), 1);

        let info = upload.commit().await.unwrap();
        assert_eq!(info.key, "talks/intro.mp4");
        assert_eq!(info.size, 11);
        assert_eq!(
            info.etag.as_deref(),
            Some(format!("{:x}", md5::compute(b"hello world")).as_str())
        );

        let listed = project.list_objects("videos").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size_bytes, 11);

        let (_, metadata) = project
            .object_metadata("videos", "talks/intro.mp4")
            .await
            .unwrap();
        assert_eq!(metadata["Author"], "A");
        assert_eq!(
            project.read_object("videos", "talks/intro.mp4").await.unwrap(),
            b"hello world"
        );
        assert!(temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn abort_and_drop_leave_nothing_behind() {
        let (dir, project) = project().await;
        project
            .ensure_bucket("videos", &CancellationToken::new())
            .await
            .unwrap();

        let mut aborted = project.open_upload("videos", "a.mp4").await.unwrap();
        aborted.write(b"partial").await.unwrap();
        aborted.abort().await.unwrap();

        let mut dropped = project.open_upload("videos", "b.mp4").await.unwrap();
        dropped.write(b"partial").await.unwrap();
        drop(dropped);

        assert!(project.list_objects("videos").await.unwrap().is_empty());
        assert!(temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn empty_key_gets_default_name() {
        let (_dir, project) = project().await;
        project
            .ensure_bucket("videos", &CancellationToken::new())
            .await
            .unwrap();
        let upload = project.open_upload("videos", "").await.unwrap();
        let info = upload.commit().await.unwrap();
        assert!(info.key.starts_with("upload-"));
        assert_eq!(info.size, 0);
    }

    #[tokio::test]
    async fn recommit_replaces_payload_and_metadata() {
        let (dir, project) = project().await;
        project
            .ensure_bucket("videos", &CancellationToken::new())
            .await
            .unwrap();

        for title in ["first", "second"] {
            commit_bytes(&project, "clip", title.as_bytes(), title).await;
        }

        let (object, metadata) = project.object_metadata("videos", "clip").await.unwrap();
        assert_eq!(object.size_bytes, 6);
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata["OriginalTitle"], "second");
        assert_eq!(project.list_objects("videos").await.unwrap().len(), 1);
        assert_eq!(project.read_object("videos", "clip").await.unwrap(), b"second");
        // the replaced payload is gone
        assert_eq!(payload_files(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn failed_recommit_keeps_committed_object_readable() {
        let (dir, project) = project().await;
        project
            .ensure_bucket("videos", &CancellationToken::new())
            .await
            .unwrap();
        commit_bytes(&project, "clip", b"original", "first").await;

        // make the metadata step of the next commit fail
        sqlx::query("DROP TABLE object_metadata")
            .execute(&*project.db)
            .await
            .unwrap();

        let mut upload = project.open_upload("videos", "clip").await.unwrap();
        upload.write(b"replacement").await.unwrap();
        let err = upload.commit().await.unwrap_err();
        assert!(matches!(err, StorageError::Sqlx(_)));

        let listed = project.list_objects("videos").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size_bytes, 8);
        assert_eq!(listed[0].etag, format!("{:x}", md5::compute(b"original")));
        assert_eq!(project.read_object("videos", "clip").await.unwrap(), b"original");
        assert_eq!(payload_files(dir.path()).len(), 1);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn commit_interrupted_after_rename_keeps_committed_object() {
        let (dir, project) = project().await;
        project
            .ensure_bucket("videos", &CancellationToken::new())
            .await
            .unwrap();
        commit_bytes(&project, "clip", b"original", "first").await;

        // stop between moving the payload and recording the row
        let mut upload = project.begin_upload("videos", "clip").await.unwrap();
        upload.write(b"replacement").await.unwrap();
        upload
            .set_metadata(CustomMetadata::from([("OriginalTitle".into(), "second".into())]))
            .await
            .unwrap();
        upload.publish().await.unwrap();
        drop(upload);

        let (object, metadata) = project.object_metadata("videos", "clip").await.unwrap();
        assert_eq!(object.size_bytes, 8);
        assert_eq!(metadata["OriginalTitle"], "first");
        assert_eq!(project.read_object("videos", "clip").await.unwrap(), b"original");
        assert_eq!(payload_files(dir.path()).len(), 1);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn dropped_open_upload_leaves_no_temp_file() {
        let (dir, project) = project().await;
        project
            .ensure_bucket("videos", &CancellationToken::new())
            .await
            .unwrap();

        for polls in 0..32 {
            let mut opening = Box::pin(project.open_upload("videos", "clip"));
            for _ in 0..polls {
                if let Poll::Ready(res) = futures::poll!(&mut opening) {
                    drop(res.unwrap());
                    break;
                }
                tokio::task::yield_now().await;
            }
            drop(opening);
            assert!(temp_files(dir.path()).is_empty(), "after {polls} polls");
        }
    }

    #[tokio::test]
    async fn open_project_honours_cancellation() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let access = AccessGrant::new(dir.path());
        let err = LocalStorage
            .open_project(&access, &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Cancelled));
    }
}
