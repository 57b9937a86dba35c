//! Object-Store Client (C1): a thin wrapper exposing "put file with
//! metadata" and nothing else. The upload pipeline (C2) owns retry-on-put
//! and local-delete-on-success; this module owns only the transport.

use anyhow::{Context, Result};
use aws_config::{meta::region::RegionProviderChain, retry::RetryConfig, BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Builder as S3ConfigBuilder, primitives::ByteStream, Client};
use std::path::Path;
use tracing::debug;

/// Files at or above this size use a multipart upload instead of a single
/// `PutObject` call (S3's documented minimum part size is 5 MiB; the spec
/// picks a larger, round threshold matching the source's transfer config).
pub const MULTIPART_THRESHOLD_BYTES: u64 = 25 * 1024 * 1024;
pub const MULTIPART_PART_SIZE_BYTES: u64 = 25 * 1024 * 1024;

const TRANSPORT_MAX_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub tls_enabled: bool,
}

/// Object metadata attached to every archived segment.
#[derive(Clone, Debug)]
pub struct ObjectMetadata {
    pub stream: String,
    pub session: String,
    pub recorded_at: String,
}

pub struct ObjectStoreClient {
    inner: Client,
    bucket: String,
}

impl ObjectStoreClient {
    pub async fn new(cfg: &ObjectStoreConfig) -> Result<Self> {
        let region = Region::new(cfg.region.clone());
        let region_provider = RegionProviderChain::first_try(region.clone()).or_default_provider();
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .retry_config(RetryConfig::adaptive().with_max_attempts(TRANSPORT_MAX_ATTEMPTS))
            .load()
            .await;

        let endpoint = if cfg.tls_enabled {
            cfg.endpoint.replace("http://", "https://")
        } else {
            cfg.endpoint.clone()
        };

        let conf = S3ConfigBuilder::from(&base)
            .region(region)
            .endpoint_url(endpoint)
            .force_path_style(true)
            .credentials_provider(Credentials::new(
                cfg.access_key.clone(),
                cfg.secret_key.clone(),
                None,
                None,
                "archiver-static",
            ))
            .build();

        Ok(Self {
            inner: Client::from_conf(conf),
            bucket: cfg.bucket.clone(),
        })
    }

    /// Put a local file at `key`, tagged with `metadata`. Multipart for
    /// large files, single-shot otherwise.
    pub async fn put(&self, local_path: &Path, key: &str, metadata: &ObjectMetadata) -> Result<()> {
        let size = tokio::fs::metadata(local_path)
            .await
            .with_context(|| format!("stat {}", local_path.display()))?
            .len();

        if size >= MULTIPART_THRESHOLD_BYTES {
            self.put_multipart(local_path, key, metadata, size).await
        } else {
            self.put_single(local_path, key, metadata).await
        }
    }

    async fn put_single(&self, local_path: &Path, key: &str, metadata: &ObjectMetadata) -> Result<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .with_context(|| format!("read {}", local_path.display()))?;

        self.inner
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .metadata("stream", &metadata.stream)
            .metadata("session", &metadata.session)
            .metadata("recorded_at", &metadata.recorded_at)
            .send()
            .await
            .with_context(|| format!("put {key}"))?;

        debug!(%key, bytes = "single-part", "object stored");
        Ok(())
    }

    async fn put_multipart(
        &self,
        local_path: &Path,
        key: &str,
        metadata: &ObjectMetadata,
        size: u64,
    ) -> Result<()> {
        let create = self
            .inner
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .metadata("stream", &metadata.stream)
            .metadata("session", &metadata.session)
            .metadata("recorded_at", &metadata.recorded_at)
            .send()
            .await
            .with_context(|| format!("create multipart upload for {key}"))?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| anyhow::anyhow!("missing upload id for {key}"))?
            .to_string();

        let result = self
            .upload_parts(local_path, key, &upload_id, size)
            .await;

        match result {
            Ok(completed_parts) => {
                self.inner
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        aws_sdk_s3::types::CompletedMultipartUpload::builder()
                            .set_parts(Some(completed_parts))
                            .build(),
                    )
                    .send()
                    .await
                    .with_context(|| format!("complete multipart upload for {key}"))?;
                debug!(%key, parts = "multipart", "object stored");
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .inner
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        local_path: &Path,
        key: &str,
        upload_id: &str,
        size: u64,
    ) -> Result<Vec<aws_sdk_s3::types::CompletedPart>> {
        let part_count = size.div_ceil(MULTIPART_PART_SIZE_BYTES);
        let mut parts = Vec::with_capacity(part_count as usize);

        for part_number in 1..=part_count {
            let offset = (part_number - 1) * MULTIPART_PART_SIZE_BYTES;
            let length = MULTIPART_PART_SIZE_BYTES.min(size - offset);

            let body = ByteStream::read_from()
                .path(local_path)
                .offset(offset)
                .length(aws_smithy_types::byte_stream::Length::Exact(length))
                .build()
                .await
                .with_context(|| format!("read part {part_number} of {key}"))?;

            let resp = self
                .inner
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number as i32)
                .body(body)
                .send()
                .await
                .with_context(|| format!("upload part {part_number} of {key}"))?;

            let etag = resp
                .e_tag()
                .ok_or_else(|| anyhow::anyhow!("missing etag for part {part_number} of {key}"))?
                .to_string();

            parts.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_number as i32)
                    .e_tag(etag)
                    .build(),
            );
        }

        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_and_part_size_match_spec() {
        assert_eq!(MULTIPART_THRESHOLD_BYTES, 25 * 1024 * 1024);
        assert_eq!(MULTIPART_PART_SIZE_BYTES, 25 * 1024 * 1024);
    }

    #[test]
    fn part_count_divides_ceiling() {
        let size = MULTIPART_PART_SIZE_BYTES * 2 + 1;
        let count = size.div_ceil(MULTIPART_PART_SIZE_BYTES);
        assert_eq!(count, 3);
    }
}
