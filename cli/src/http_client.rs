use anyhow::{Context, Result};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::multipart::Form;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::ErrorResponse;

#[derive(Clone)]
pub struct Client {
    base_url: Url,
    http: reqwest::Client,
    user_agent: String,
    retries: u32,
}

impl Client {
    pub fn new(base_url: &str, timeout: Duration, retries: u32) -> Result<Self> {
        let base_url = Url::parse(base_url).context("Invalid base URL")?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url,
            http,
            user_agent: format!("erebrusctl/{}", env!("CARGO_PKG_VERSION")),
            retries,
        })
    }

    pub fn build_url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).with_context(|| {
            format!(
                "Failed to join base_url={} with path={}",
                self.base_url, path
            )
        })
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("user-agent", &self.user_agent)
            .header("x-request-id", Uuid::new_v4().to_string())
    }

    /// Send a request and pretty-print the JSON response.
    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        let bytes = self.send_json_bytes(method, path, body).await?;
        print_bytes(&bytes)?;
        Ok(())
    }

    pub async fn send_json_bytes(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Vec<u8>> {
        let url = self.build_url(path)?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut req = self.request(method.clone(), url.clone());
            if let Some(b) = &body {
                req = req.json(b);
            }

            debug!("HTTP {} {} (attempt {})", method, url, attempt);
            let resp = req.send().await.context("Request failed")?;
            let status = resp.status();

            if status.is_success() {
                let bytes = resp.bytes().await.unwrap_or_default().to_vec();
                return Ok(bytes);
            }

            let bytes = resp.bytes().await.unwrap_or_default();

            // Only idempotent reads and deletes are retried on 5xx.
            if attempt <= self.retries && should_retry(&method, status) {
                tokio::time::sleep(Duration::from_millis(300)).await;
                continue;
            }

            return Err(render_error(&method, &url, status, &bytes));
        }
    }

    /// POST a multipart form once; uploads are never retried.
    pub async fn send_multipart(&self, path: &str, form: Form) -> Result<()> {
        let url = self.build_url(path)?;

        debug!("HTTP(multipart) POST {}", url);
        let resp = self
            .request(Method::POST, url.clone())
            .multipart(form)
            .send()
            .await
            .context("Request failed")?;
        let status = resp.status();
        let bytes = resp.bytes().await.unwrap_or_default();

        if !status.is_success() {
            return Err(render_error(&Method::POST, &url, status, &bytes));
        }
        print_bytes(&bytes)
    }

    pub async fn download_to_file(&self, path: &str, out_path: &Path) -> Result<()> {
        let url = self.build_url(path)?;

        debug!("HTTP(download) GET {}", url);
        let resp = self
            .request(Method::GET, url.clone())
            .send()
            .await
            .context("Request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await.unwrap_or_default();
            return Err(render_error(&Method::GET, &url, status, &bytes));
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create dir {:?}", parent))?;
        }

        let mut file = std::fs::File::create(out_path)
            .with_context(|| format!("Failed to create {:?}", out_path))?;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Stream read failed")?;
            file.write_all(&chunk).context("file write failed")?;
        }
        Ok(())
    }

    pub async fn stream_to_stdout(&self, path: &str) -> Result<()> {
        let url = self.build_url(path)?;

        debug!("HTTP(stream) GET {}", url);
        let resp = self
            .request(Method::GET, url.clone())
            .send()
            .await
            .context("Request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await.unwrap_or_default();
            return Err(render_error(&Method::GET, &url, status, &bytes));
        }

        let mut out = std::io::stdout().lock();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Stream read failed")?;
            out.write_all(&chunk).context("stdout write failed")?;
            out.flush().ok();
        }
        Ok(())
    }
}

fn render_error(method: &Method, url: &Url, status: StatusCode, bytes: &[u8]) -> anyhow::Error {
    match serde_json::from_slice::<ErrorResponse>(bytes) {
        Ok(e) => anyhow::anyhow!(
            "HTTP {} {} failed: status={} error_code={} error={}{}",
            method,
            url,
            status.as_u16(),
            e.error_code.unwrap_or_default(),
            e.error.unwrap_or_default(),
            if e.details.is_empty() {
                String::new()
            } else {
                format!(" details=[{}]", e.details.join("; "))
            }
        ),
        Err(_) => anyhow::anyhow!(
            "HTTP {} {} failed: status={} body={}",
            method,
            url,
            status.as_u16(),
            String::from_utf8_lossy(bytes)
        ),
    }
}

fn should_retry(method: &Method, status: StatusCode) -> bool {
    status.is_server_error() && matches!(*method, Method::GET | Method::DELETE)
}

/// Percent-encode one path segment (service names, agent ids).
pub fn segment(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

fn print_bytes(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        println!("{}", r#"{"success":true}"#);
        return Ok(());
    }
    if let Ok(v) = serde_json::from_slice::<serde_json::Value>(bytes) {
        println!("{}", serde_json::to_string_pretty(&v)?);
    } else {
        println!("{}", String::from_utf8_lossy(bytes));
    }
    Ok(())
}
