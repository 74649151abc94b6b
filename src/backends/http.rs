//! 基于 HTTP 的存储与远端处理客户端。
//!
//! 对应一套 Supabase 风格的 REST 面：对象写到
//! `storage/v1/object/{bucket}/{path}`，公开地址在 `object/public/` 下，
//! 处理函数挂在 `functions/v1/` 下。

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use pin_project_lite::pin_project;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::debug;
use url::Url;
use crate::core::errors::{Result, UploadError};
use crate::core::traits::{ObjectStorage, RemoteProcessor};
use crate::core::types::ClipMetadata;

/// 请求体按这个粒度切块发送
const BODY_CHUNK_SIZE: usize = 64 * 1024;

pin_project! {
    /// 包装请求体流，统计实际发出的字节数
    struct CountingStream<S> {
        #[pin]
        inner: S,
        sent: Arc<AtomicU64>,
    }
}

impl<S> Stream for CountingStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

fn bearer_headers(api_key: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
        .map_err(|err| UploadError::Config(err.to_string()))?;
    headers.insert(AUTHORIZATION, value);
    Ok(headers)
}

fn join_url(endpoint: &Url, path: &str) -> Result<Url> {
    endpoint
        .join(path)
        .map_err(|err| UploadError::Config(format!("Invalid url path {path}: {err}")))
}

/// 对象存储 REST 客户端
#[derive(Clone)]
pub struct HttpObjectStorage {
    client: Client,
    endpoint: Url,
    api_key: String,
}

impl HttpObjectStorage {
    pub fn new(endpoint: &str, api_key: impl Into<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|_| UploadError::Config(format!("Invalid endpoint url: {endpoint}")))?;

        Ok(Self {
            client: Client::new(),
            endpoint,
            api_key: api_key.into(),
        })
    }

    fn object_url(&self, bucket: &str, path: &str) -> Result<Url> {
        join_url(&self.endpoint, &format!("storage/v1/object/{bucket}/{path}"))
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
        upsert: bool,
    ) -> Result<()> {
        let url = self.object_url(bucket, path)?;
        let total = data.len() as u64;

        // Bytes::slice 是零拷贝的
        let chunks: Vec<std::io::Result<Bytes>> = (0..data.len())
            .step_by(BODY_CHUNK_SIZE)
            .map(|start| {
                let end = usize::min(start + BODY_CHUNK_SIZE, data.len());
                Ok(data.slice(start..end))
            })
            .collect();

        let sent = Arc::new(AtomicU64::new(0));
        let body_stream = CountingStream {
            inner: stream::iter(chunks),
            sent: sent.clone(),
        };

        let mut headers = bearer_headers(&self.api_key)?;
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(content_type)
                .map_err(|err| UploadError::Config(err.to_string()))?,
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
        if upsert {
            headers.insert("x-upsert", HeaderValue::from_static("true"));
        }

        let started = Instant::now();
        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body_stream))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UploadError::storage_status(status.as_u16(), message));
        }

        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            debug!(
                bucket,
                path,
                bytes = sent.load(Ordering::Relaxed),
                mb_per_sec = total as f64 / elapsed / (1024.0 * 1024.0),
                "object uploaded"
            );
        }

        Ok(())
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Bytes> {
        let url = self.object_url(bucket, path)?;
        let response = self
            .client
            .get(url)
            .headers(bearer_headers(&self.api_key)?)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(UploadError::storage_status(
                status.as_u16(),
                format!("Object not found: {bucket}/{path}"),
            ));
        }
        if !status.is_success() {
            return Err(UploadError::storage_status(
                status.as_u16(),
                "Failed to download object",
            ));
        }

        let mut body = response.bytes_stream();
        let mut out: Vec<u8> = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }

        Ok(Bytes::from(out))
    }

    async fn public_url(&self, bucket: &str, path: &str) -> Result<String> {
        let url = join_url(
            &self.endpoint,
            &format!("storage/v1/object/public/{bucket}/{path}"),
        )?;
        Ok(url.to_string())
    }
}

/// 远端处理函数客户端
#[derive(Clone)]
pub struct HttpRemoteProcessor {
    client: Client,
    endpoint: Url,
    api_key: String,
    function: String,
}

impl HttpRemoteProcessor {
    pub fn new(endpoint: &str, api_key: impl Into<String>, function: impl Into<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|_| UploadError::Config(format!("Invalid endpoint url: {endpoint}")))?;

        Ok(Self {
            client: Client::new(),
            endpoint,
            api_key: api_key.into(),
            function: function.into(),
        })
    }
}

#[async_trait]
impl RemoteProcessor for HttpRemoteProcessor {
    async fn process(&self, remote_file: &str, metadata: &ClipMetadata) -> Result<()> {
        let url = join_url(&self.endpoint, &format!("functions/v1/{}", self.function))?;
        let payload = json!({
            "fileName": remote_file,
            "metadata": metadata,
        });

        let response = self
            .client
            .post(url)
            .headers(bearer_headers(&self.api_key)?)
            .json(&payload)
            .send()
            .await
            .map_err(|err| UploadError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UploadError::Transport(format!(
                "Processing call failed with status {status}: {message}"
            )));
        }

        // 响应体里的显式失败标记也算失败
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| UploadError::Transport(err.to_string()))?;
        if body.get("success").and_then(|v| v.as_bool()) == Some(false) {
            let reason = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            return Err(UploadError::Transport(format!(
                "Processing rejected: {reason}"
            )));
        }

        Ok(())
    }
}
