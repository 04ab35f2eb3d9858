use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::{BlobStore, ObjectMeta, StoreError};

/// Blob store reached over plain HTTP(S): objects live at
/// `<base>/<bucket>/<key>`, sized with `HEAD` and fetched with `GET`.
pub struct HttpBlobStore {
    client: Client,
    base: Url,
    max_retry: u32,
}

impl HttpBlobStore {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    /// `timeout` bounds each request, including the full body transfer.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let base = Url::parse(base_url).with_context(|| format!("invalid store URL {base_url:?}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("store URL {base_url:?} cannot carry object paths"));
        }
        Ok(Self {
            client,
            base,
            max_retry: 3,
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("store URL cannot carry object paths"))?
            .pop_if_empty()
            .push(bucket)
            .extend(key.split('/'));
        Ok(url)
    }

    fn map_error(err: reqwest::Error, bucket: &str, key: &str) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout(format!("{bucket}/{key}"))
        } else {
            StoreError::Other(anyhow::Error::new(err).context(format!("requesting {bucket}/{key}")))
        }
    }

    fn check_status(status: StatusCode, bucket: &str, key: &str) -> Result<(), StoreError> {
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(format!("{bucket}/{key}"))),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                Err(StoreError::Timeout(format!("{bucket}/{key}")))
            }
            s => Err(StoreError::Other(anyhow!("HTTP request failed with status: {s}"))),
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError> {
        let url = self.object_url(bucket, key)?;

        let mut retry_count = 0;
        let resp = loop {
            match self.client.head(url.clone()).send().await {
                Ok(resp) => break resp,
                Err(e) if e.is_connect() && retry_count + 1 < self.max_retry => {
                    retry_count += 1;
                    warn!(retry = retry_count, max = self.max_retry, error = %e, "connection error, retrying");
                    tokio::time::sleep(Duration::from_millis(500 * retry_count as u64)).await;
                }
                Err(e) => return Err(Self::map_error(e, bucket, key)),
            }
        };
        Self::check_status(resp.status(), bucket, key)?;

        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("Remote server did not return Content-Length"))?;
        Ok(ObjectMeta { size })
    }

    async fn download_object(&self, bucket: &str, key: &str, destination: &Path) -> Result<(), StoreError> {
        let url = self.object_url(bucket, key)?;
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::map_error(e, bucket, key))?;
        Self::check_status(resp.status(), bucket, key)?;

        let mut file = tokio::fs::File::create(destination)
            .await
            .with_context(|| format!("creating {}", destination.display()))?;
        while let Some(chunk) = resp.chunk().await.map_err(|e| Self::map_error(e, bucket, key))? {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("writing {}", destination.display()))?;
        }
        file.flush().await.context("flushing download")?;
        Ok(())
    }
}
