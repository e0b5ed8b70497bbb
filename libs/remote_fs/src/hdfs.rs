//! HDFS adapter over the pure-Rust namenode client.

use std::time::{Duration, SystemTime};

use hdfs_native::{Client, WriteOptions};

use crate::{
    BlockLocation, CreateOptions, FilesystemDescriptor, FsError, FsObjectStatus, RemoteFileSystem,
    RemotePath, RemoteReader, RemoteWriter,
};

const HDFS_BLOCK_SIZE: u64 = 128 * 1024 * 1024;

/// Chunk size for the client-side copy loop.
const COPY_CHUNK: usize = 4 * 1024 * 1024;

pub(crate) fn map_hdfs_error(e: hdfs_native::HdfsError) -> FsError {
    match e {
        hdfs_native::HdfsError::FileNotFound(_) => FsError::NotFound,
        hdfs_native::HdfsError::AlreadyExists(path) => {
            FsError::BadInput(format!("{path} already exists"))
        }
        other => FsError::Other(anyhow::Error::new(other)),
    }
}

pub struct HdfsFs {
    client: Client,
    /// Namenode host, reported as the serving host of synthesized block
    /// locations; per-datanode topology stays below the client's surface.
    namenode: String,
}

impl HdfsFs {
    pub fn dial(descriptor: &FilesystemDescriptor) -> Result<Self, FsError> {
        let url = if descriptor.port == 0 {
            format!("hdfs://{}", descriptor.host)
        } else {
            format!("hdfs://{}:{}", descriptor.host, descriptor.port)
        };
        let client = Client::new(&url).map_err(map_hdfs_error)?;
        Ok(HdfsFs {
            client,
            namenode: descriptor.host.clone(),
        })
    }

    fn status_from(&self, status: hdfs_native::client::FileStatus) -> Result<FsObjectStatus, FsError> {
        let path = RemotePath::from_string(&status.path)
            .map_err(|e| FsError::BadInput(e.to_string()))?;
        Ok(FsObjectStatus {
            path,
            is_dir: status.isdir,
            size: status.length as u64,
            modified_at: SystemTime::UNIX_EPOCH
                .checked_add(Duration::from_millis(status.modification_time)),
            owner: Some(status.owner),
            group: Some(status.group),
            permission: Some(status.permission as u32),
            block_size: HDFS_BLOCK_SIZE,
        })
    }
}

#[async_trait::async_trait]
impl RemoteFileSystem for HdfsFs {
    async fn exists(&self, path: &RemotePath) -> Result<bool, FsError> {
        match self.client.get_file_info(&path.as_absolute()).await {
            Ok(_) => Ok(true),
            Err(hdfs_native::HdfsError::FileNotFound(_)) => Ok(false),
            Err(e) => Err(map_hdfs_error(e)),
        }
    }

    async fn file_status(&self, path: &RemotePath) -> Result<FsObjectStatus, FsError> {
        let status = self
            .client
            .get_file_info(&path.as_absolute())
            .await
            .map_err(map_hdfs_error)?;
        self.status_from(status)
    }

    async fn list_status(&self, path: &RemotePath) -> Result<Vec<FsObjectStatus>, FsError> {
        let children = self
            .client
            .list_status(&path.as_absolute(), false)
            .await
            .map_err(map_hdfs_error)?;
        children.into_iter().map(|s| self.status_from(s)).collect()
    }

    async fn block_locations(&self, path: &RemotePath) -> Result<Vec<BlockLocation>, FsError> {
        let status = self.file_status(path).await?;
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < status.size || blocks.is_empty() {
            let length = (status.size - offset).min(HDFS_BLOCK_SIZE);
            blocks.push(BlockLocation {
                offset,
                length,
                hosts: vec![self.namenode.clone()],
                disk_ids: vec![],
            });
            if length == 0 {
                break;
            }
            offset += length;
        }
        Ok(blocks)
    }

    async fn open_read(&self, path: &RemotePath) -> Result<RemoteReader, FsError> {
        let reader = self
            .client
            .read(&path.as_absolute())
            .await
            .map_err(map_hdfs_error)?;
        let len = reader.file_length() as u64;
        Ok(RemoteReader::new(crate::ReaderKind::Hdfs(reader), len))
    }

    async fn create_write(
        &self,
        path: &RemotePath,
        opts: CreateOptions,
    ) -> Result<RemoteWriter, FsError> {
        let mut write_options = WriteOptions::default();
        write_options.overwrite = opts.overwrite;
        if let Some(replication) = opts.replication {
            write_options.replication = Some(replication);
        }
        if let Some(block_size) = opts.block_size {
            write_options.block_size = Some(block_size);
        }
        let writer = self
            .client
            .create(&path.as_absolute(), write_options)
            .await
            .map_err(map_hdfs_error)?;
        Ok(RemoteWriter::new(crate::WriterKind::Hdfs(writer)))
    }

    async fn create_directory(&self, path: &RemotePath) -> Result<(), FsError> {
        self.client
            .mkdirs(&path.as_absolute(), 0o755, true)
            .await
            .map_err(map_hdfs_error)
    }

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> Result<(), FsError> {
        self.client
            .rename(&from.as_absolute(), &to.as_absolute(), false)
            .await
            .map_err(map_hdfs_error)
    }

    async fn delete(&self, path: &RemotePath, recursive: bool) -> Result<bool, FsError> {
        self.client
            .delete(&path.as_absolute(), recursive)
            .await
            .map_err(map_hdfs_error)
    }

    async fn copy(&self, from: &RemotePath, to: &RemotePath) -> Result<(), FsError> {
        // No server-side copy in the protocol; stream through the client.
        let mut reader = self.open_read(from).await?;
        let mut writer = self
            .create_write(
                to,
                CreateOptions {
                    overwrite: true,
                    ..Default::default()
                },
            )
            .await?;
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(&buf[..n]).await?;
        }
        writer.close().await?;
        Ok(())
    }

    async fn chown(
        &self,
        path: &RemotePath,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> Result<(), FsError> {
        self.client
            .set_owner(&path.as_absolute(), owner, group)
            .await
            .map_err(map_hdfs_error)
    }

    async fn chmod(&self, path: &RemotePath, mode: u32) -> Result<(), FsError> {
        self.client
            .set_permission(&path.as_absolute(), mode)
            .await
            .map_err(map_hdfs_error)
    }

    async fn set_replication(&self, path: &RemotePath, replication: u32) -> Result<bool, FsError> {
        self.client
            .set_replication(&path.as_absolute(), replication)
            .await
            .map_err(map_hdfs_error)
    }

    async fn get_used(&self) -> Result<u64, FsError> {
        let summary = self
            .client
            .get_content_summary("/")
            .await
            .map_err(map_hdfs_error)?;
        Ok(summary.length as u64)
    }

    async fn get_capacity(&self) -> Result<u64, FsError> {
        // The client does not expose the namenode's fsStats call.
        Err(FsError::Unsupported)
    }

    fn default_block_size(&self) -> u64 {
        HDFS_BLOCK_SIZE
    }
}
