//! AWS S3 adapter serving `s3n`/`s3a` descriptors.
//!
//! The descriptor host is the bucket name, as in `s3a://warehouse/...`.
//! The SDK's own retry machinery is disabled to a single attempt: retrying
//! is the bridge's job, and doubling it up would multiply the worst-case
//! latency the executor is supposed to bound.

use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use aws_config::{
    environment::credentials::EnvironmentVariableCredentialsProvider,
    imds::credentials::ImdsCredentialsProvider, meta::credentials::CredentialsProviderChain,
    profile::ProfileFileCredentialsProvider, retry::{RetryConfigBuilder, RetryMode},
    BehaviorVersion,
};
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::{
    config::{AsyncSleep, Builder, Region, SharedAsyncSleep},
    primitives::ByteStream,
    Client,
};
use aws_smithy_async::rt::sleep::TokioSleep;
use bytes::Bytes;

use crate::{
    BlockLocation, CreateOptions, FilesystemDescriptor, FsError, FsObjectStatus, RemoteFileSystem,
    RemoteFsConfig, RemotePath, RemoteReader, RemoteWriter,
};

/// Block size the Hadoop S3 connectors advertise for planning purposes.
const S3_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

const MAX_KEYS_PER_DELETE: usize = 1000;

pub struct S3Bucket {
    client: Client,
    bucket_name: String,
    // Per-request timeout for data-plane calls that bypass the executor.
    timeout: Duration,
}

impl S3Bucket {
    pub async fn new(
        descriptor: &FilesystemDescriptor,
        config: &RemoteFsConfig,
    ) -> Result<Self, FsError> {
        if descriptor.host.is_empty() {
            return Err(FsError::BadInput(format!(
                "s3 descriptor {descriptor} names no bucket"
            )));
        }

        let region = Region::new(
            config
                .s3_region
                .clone()
                .or_else(|| std::env::var("AWS_REGION").ok())
                .unwrap_or_else(|| "us-east-1".to_owned()),
        );

        let credentials_provider = match (&descriptor.credentials, &descriptor.credentials_key) {
            (Some(access_key), Some(secret_key)) => SharedCredentialsProvider::new(
                aws_credential_types::Credentials::new(
                    access_key.clone(),
                    secret_key.clone(),
                    None,
                    None,
                    "filesystem-descriptor",
                ),
            ),
            _ => SharedCredentialsProvider::new(
                CredentialsProviderChain::first_try(
                    "env",
                    EnvironmentVariableCredentialsProvider::new(),
                )
                .or_else("profile", ProfileFileCredentialsProvider::builder().build())
                .or_else("imds", ImdsCredentialsProvider::builder().build()),
            ),
        };

        let sleep_impl: std::sync::Arc<dyn AsyncSleep> = std::sync::Arc::new(TokioSleep::new());

        let mut retry_config = RetryConfigBuilder::new();
        retry_config
            .set_max_attempts(Some(1))
            .set_mode(Some(RetryMode::Adaptive));

        let mut config_builder = Builder::default()
            .behavior_version(BehaviorVersion::v2023_11_09())
            .region(region)
            .credentials_provider(credentials_provider)
            .retry_config(retry_config.build())
            .sleep_impl(SharedAsyncSleep::from(sleep_impl));

        if let Some(endpoint) = config.s3_endpoint.clone() {
            config_builder = config_builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(S3Bucket {
            client: Client::from_conf(config_builder.build()),
            bucket_name: descriptor.host.clone(),
            timeout: config.timeouts_for(descriptor).timeout_base,
        })
    }

    fn key_of(&self, path: &RemotePath) -> String {
        path.as_str().to_owned()
    }

    fn status_of_object(
        &self,
        path: RemotePath,
        size: u64,
        modified_at: Option<SystemTime>,
    ) -> FsObjectStatus {
        FsObjectStatus {
            path,
            is_dir: false,
            size,
            modified_at,
            owner: None,
            group: None,
            permission: None,
            block_size: S3_BLOCK_SIZE,
        }
    }

    fn dir_status(&self, path: RemotePath) -> FsObjectStatus {
        FsObjectStatus {
            path,
            is_dir: true,
            size: 0,
            modified_at: None,
            owner: None,
            group: None,
            permission: None,
            block_size: S3_BLOCK_SIZE,
        }
    }

    /// A "directory" in a flat keyspace: any object lives under the prefix.
    async fn prefix_is_nonempty(&self, prefix: &str) -> Result<bool, FsError> {
        let request = self
            .client
            .list_objects_v2()
            .bucket(self.bucket_name.clone())
            .prefix(format!("{prefix}/"))
            .max_keys(1)
            .send();
        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(FsError::Timeout),
        };
        let response = response
            .context("Failed to probe S3 prefix")
            .map_err(FsError::Other)?;
        Ok(!response.contents().is_empty())
    }
}

#[async_trait::async_trait]
impl RemoteFileSystem for S3Bucket {
    async fn exists(&self, path: &RemotePath) -> Result<bool, FsError> {
        match self.file_status(path).await {
            Ok(_) => Ok(true),
            Err(FsError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn file_status(&self, path: &RemotePath) -> Result<FsObjectStatus, FsError> {
        let key = self.key_of(path);
        let request = self
            .client
            .head_object()
            .bucket(self.bucket_name.clone())
            .key(key.clone())
            .send();
        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(FsError::Timeout),
        };
        match response {
            Ok(head) => Ok(self.status_of_object(
                path.clone(),
                head.content_length().unwrap_or_default() as u64,
                head.last_modified().cloned().and_then(|t| t.try_into().ok()),
            )),
            Err(sdk_error) => {
                if sdk_error
                    .as_service_error()
                    .is_some_and(|e| e.is_not_found())
                {
                    // The key may still denote a "directory" prefix.
                    if self.prefix_is_nonempty(&key).await? {
                        return Ok(self.dir_status(path.clone()));
                    }
                    return Err(FsError::NotFound);
                }
                Err(FsError::Other(
                    anyhow::Error::new(sdk_error).context("Failed to stat S3 object"),
                ))
            }
        }
    }

    async fn list_status(&self, path: &RemotePath) -> Result<Vec<FsObjectStatus>, FsError> {
        let prefix = format!("{}/", self.key_of(path));
        let mut statuses = Vec::new();
        let mut continuation_token = None;
        loop {
            let request = self
                .client
                .list_objects_v2()
                .bucket(self.bucket_name.clone())
                .prefix(prefix.clone())
                .delimiter("/")
                .set_continuation_token(continuation_token)
                .send();
            let response = tokio::select! {
                res = request => res,
                _ = tokio::time::sleep(self.timeout) => return Err(FsError::Timeout),
            };
            let response = response
                .context("Failed to list S3 prefix")
                .map_err(FsError::Other)?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let remote = RemotePath::from_string(key)
                    .map_err(|e| FsError::BadInput(e.to_string()))?;
                statuses.push(self.status_of_object(
                    remote,
                    object.size().unwrap_or_default() as u64,
                    object.last_modified().cloned().and_then(|t| t.try_into().ok()),
                ));
            }
            for common_prefix in response.common_prefixes() {
                let Some(p) = common_prefix.prefix() else { continue };
                let remote = RemotePath::from_string(p.trim_end_matches('/'))
                    .map_err(|e| FsError::BadInput(e.to_string()))?;
                statuses.push(self.dir_status(remote));
            }

            continuation_token = match response.next_continuation_token {
                Some(token) => Some(token),
                None => break,
            };
        }
        Ok(statuses)
    }

    async fn block_locations(&self, path: &RemotePath) -> Result<Vec<BlockLocation>, FsError> {
        // Object stores expose no block topology; one block spanning the
        // object keeps scan planning honest about locality (there is none).
        let status = self.file_status(path).await?;
        Ok(vec![BlockLocation {
            offset: 0,
            length: status.size,
            hosts: vec![self.bucket_name.clone()],
            disk_ids: vec![],
        }])
    }

    async fn open_read(&self, path: &RemotePath) -> Result<RemoteReader, FsError> {
        let status = self.file_status(path).await?;
        if status.is_dir {
            return Err(FsError::BadInput(format!("{path} is a directory")));
        }
        Ok(RemoteReader::new(
            crate::ReaderKind::S3(S3ObjectReader {
                client: self.client.clone(),
                bucket: self.bucket_name.clone(),
                key: self.key_of(path),
                timeout: self.timeout,
            }),
            status.size,
        ))
    }

    async fn create_write(
        &self,
        path: &RemotePath,
        opts: CreateOptions,
    ) -> Result<RemoteWriter, FsError> {
        if !opts.overwrite && self.exists(path).await? {
            return Err(FsError::BadInput(format!("{path} already exists")));
        }
        Ok(RemoteWriter::new(crate::WriterKind::S3(S3ObjectWriter {
            client: self.client.clone(),
            bucket: self.bucket_name.clone(),
            key: self.key_of(path),
            timeout: self.timeout,
            buf: Vec::new(),
        })))
    }

    async fn create_directory(&self, path: &RemotePath) -> Result<(), FsError> {
        // Flat keyspace: a trailing-slash marker object is the convention.
        let request = self
            .client
            .put_object()
            .bucket(self.bucket_name.clone())
            .key(format!("{}/", self.key_of(path)))
            .body(ByteStream::from(Bytes::new()))
            .send();
        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(FsError::Timeout),
        };
        response
            .map(|_| ())
            .context("Failed to create S3 directory marker")
            .map_err(FsError::Other)
    }

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> Result<(), FsError> {
        self.copy(from, to).await?;
        self.delete(from, false).await?;
        Ok(())
    }

    async fn delete(&self, path: &RemotePath, recursive: bool) -> Result<bool, FsError> {
        if !recursive {
            return self.delete_single(&self.key_of(path)).await;
        }
        let mut keys = self.list_all_keys(&format!("{}/", self.key_of(path))).await?;
        let existed = !keys.is_empty() || {
            match self.file_status(path).await {
                Ok(_) => true,
                Err(FsError::NotFound) => false,
                Err(e) => return Err(e),
            }
        };
        keys.push(self.key_of(path));
        for chunk in keys.chunks(MAX_KEYS_PER_DELETE) {
            let mut delete_objects = Vec::with_capacity(chunk.len());
            for key in chunk {
                let obj_id = aws_sdk_s3::types::ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .context("Failed to build S3 object identifier")
                    .map_err(FsError::Other)?;
                delete_objects.push(obj_id);
            }
            let delete = aws_sdk_s3::types::Delete::builder()
                .set_objects(Some(delete_objects))
                .build()
                .context("Failed to build S3 bulk delete")
                .map_err(FsError::Other)?;
            let request = self
                .client
                .delete_objects()
                .bucket(self.bucket_name.clone())
                .delete(delete)
                .send();
            let response = tokio::select! {
                res = request => res,
                _ = tokio::time::sleep(self.timeout) => return Err(FsError::Timeout),
            };
            response
                .context("Failed to bulk delete S3 objects")
                .map_err(FsError::Other)?;
        }
        Ok(existed)
    }

    async fn copy(&self, from: &RemotePath, to: &RemotePath) -> Result<(), FsError> {
        // bucket name is part of the copy source
        let copy_source = format!("{}/{}", self.bucket_name, self.key_of(from));
        let request = self
            .client
            .copy_object()
            .bucket(self.bucket_name.clone())
            .key(self.key_of(to))
            .copy_source(copy_source)
            .send();
        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(FsError::Timeout),
        };
        response
            .map(|_| ())
            .context("Failed to copy S3 object")
            .map_err(FsError::Other)
    }

    async fn chown(
        &self,
        _path: &RemotePath,
        _owner: Option<&str>,
        _group: Option<&str>,
    ) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    async fn chmod(&self, _path: &RemotePath, _mode: u32) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    async fn set_replication(&self, _path: &RemotePath, _replication: u32) -> Result<bool, FsError> {
        Err(FsError::Unsupported)
    }

    async fn get_used(&self) -> Result<u64, FsError> {
        Err(FsError::Unsupported)
    }

    async fn get_capacity(&self) -> Result<u64, FsError> {
        Err(FsError::Unsupported)
    }

    fn default_block_size(&self) -> u64 {
        S3_BLOCK_SIZE
    }
}

impl S3Bucket {
    /// All keys under a prefix, paging through however many listings it
    /// takes.
    async fn list_all_keys(&self, prefix: &str) -> Result<Vec<String>, FsError> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let request = self
                .client
                .list_objects_v2()
                .bucket(self.bucket_name.clone())
                .prefix(prefix.to_owned())
                .set_continuation_token(continuation_token)
                .send();
            let response = tokio::select! {
                res = request => res,
                _ = tokio::time::sleep(self.timeout) => return Err(FsError::Timeout),
            };
            let response = response
                .context("Failed to list S3 prefix")
                .map_err(FsError::Other)?;
            keys.extend(response.contents().iter().filter_map(|o| o.key().map(str::to_owned)));
            continuation_token = match response.next_continuation_token {
                Some(token) => Some(token),
                None => break,
            };
        }
        Ok(keys)
    }

    async fn delete_single(&self, key: &str) -> Result<bool, FsError> {
        // S3 DeleteObject is idempotent and does not report prior existence;
        // probe first so the caller gets the POSIX-shaped answer.
        let path = RemotePath::from_string(key).map_err(|e| FsError::BadInput(e.to_string()))?;
        let existed = match self.file_status(&path).await {
            Ok(_) => true,
            Err(FsError::NotFound) => false,
            Err(e) => return Err(e),
        };
        let request = self
            .client
            .delete_object()
            .bucket(self.bucket_name.clone())
            .key(key)
            .send();
        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(FsError::Timeout),
        };
        response
            .map(|_| existed)
            .context("Failed to delete S3 object")
            .map_err(FsError::Other)
    }
}

pub(crate) struct S3ObjectReader {
    client: Client,
    bucket: String,
    key: String,
    timeout: Duration,
}

impl S3ObjectReader {
    /// Ranged GET; the byte-range header is inclusive on both ends.
    pub(crate) async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let end_inclusive = offset + buf.len() as u64 - 1;
        let request = self
            .client
            .get_object()
            .bucket(self.bucket.clone())
            .key(self.key.clone())
            .range(format!("bytes={offset}-{end_inclusive}"))
            .send();
        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(FsError::Timeout),
        };
        let response = match response {
            Ok(output) => output,
            Err(sdk_error) => {
                if sdk_error
                    .as_service_error()
                    .is_some_and(|e| e.is_no_such_key())
                {
                    return Err(FsError::NotFound);
                }
                return Err(FsError::Other(
                    anyhow::Error::new(sdk_error).context("Failed to get S3 object range"),
                ));
            }
        };
        let collected = tokio::select! {
            res = response.body.collect() => res,
            _ = tokio::time::sleep(self.timeout) => return Err(FsError::Timeout),
        };
        let bytes = collected
            .context("Failed to read S3 object body")
            .map_err(FsError::Other)?
            .into_bytes();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }
}

pub(crate) struct S3ObjectWriter {
    client: Client,
    bucket: String,
    key: String,
    timeout: Duration,
    buf: Vec<u8>,
}

impl S3ObjectWriter {
    pub(crate) fn write(&mut self, data: &[u8]) -> usize {
        self.buf.extend_from_slice(data);
        data.len()
    }

    /// S3 PUT requires the full content length up front, so the object is
    /// uploaded in one piece at close.
    pub(crate) async fn commit(self) -> Result<(), FsError> {
        let request = self
            .client
            .put_object()
            .bucket(self.bucket)
            .key(self.key)
            .content_length(self.buf.len() as i64)
            .body(ByteStream::from(Bytes::from(self.buf)))
            .send();
        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(FsError::Timeout),
        };
        response
            .map(|_| ())
            .context("Failed to upload S3 object")
            .map_err(FsError::Other)
    }
}
