//! S3-backed `ObjectStore`, for deployments that front the archive with S3
//! instead of the Azure-Blob-compatible REST endpoint. Gated behind the
//! `blob_s3` feature so the `aws-sdk-s3` dependency tree is opt-in.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use super::object_store::{ObjectStore, PutOptions};
use crate::error::{PipelineError, Result};

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self {
            client: Client::new(&config),
            bucket: bucket.into(),
        }
    }

    fn map_err(e: impl std::fmt::Display) -> PipelineError {
        let msg = e.to_string();
        let lower = msg.to_ascii_lowercase();
        if ["timeout", "throttl", "connection", "temporary", "retry", "service unavailable"]
            .iter()
            .any(|n| lower.contains(n))
        {
            PipelineError::TransientStorage { attempts: 1, message: msg }
        } else {
            PipelineError::permanent_storage(msg)
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, path: &str, bytes: Vec<u8>, opts: PutOptions) -> Result<()> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(bytes))
            .content_type(opts.content_type);
        if opts.fail_if_exists {
            req = req.if_none_match("*");
        }
        req.send().await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(Self::map_err)?;
        let bytes = resp.body.collect().await.map_err(Self::map_err)?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .send()
            .await
            .map_err(Self::map_err)?;
        Ok(resp
            .contents()
            .iter()
            .filter_map(|o| o.key().map(str::to_string))
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.client.head_object().bucket(&self.bucket).key(path).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.to_string().to_ascii_lowercase().contains("not found") {
                    Ok(false)
                } else {
                    Err(Self::map_err(e))
                }
            }
        }
    }
}
