use async_trait::async_trait;
use reqwest::StatusCode;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::InferenceService;
use crate::error::{GatewayError, Result};
use crate::models::{ChannelData, ModelResult};

/// Header carrying the shared API secret
pub const AUTH_HEADER: &str = "API_AUTH_SECRET";

#[derive(Debug, Clone)]
pub struct InferenceClientConfig {
    pub base_url: String,
    pub model_id: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

/// `InferenceService` over the model server's HTTP API.
///
/// - `POST {base}/v1/model/start/{model_id}` with a zip of `<channel>/<n>.dcm`
///   entries; the response body is the run id
/// - `GET {base}/v1/model/results/{run_id}`: 202 while running (body may hold
///   the progress percentage), 200 with the result file when done
#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    client: reqwest::Client,
    base_url: Url,
    model_id: String,
    api_key: String,
}

impl HttpInferenceClient {
    pub fn new(config: InferenceClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            GatewayError::invalid_argument(format!("Invalid inference base URL '{}': {}", config.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::invalid_argument(format!(
                "Inference base URL '{}' cannot be a base",
                config.base_url
            )));
        }
        if config.model_id.trim().is_empty() {
            return Err(GatewayError::invalid_argument("Inference model id cannot be blank"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::invalid_argument(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            model_id: config.model_id,
            api_key: config.api_key,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::invalid_argument("Inference base URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            request
        } else {
            request.header(AUTH_HEADER, &self.api_key)
        }
    }
}

/// Zip the channels as `<channel>/<index>.dcm`, index counting from 0 per channel
pub(crate) async fn build_archive(channels: &[ChannelData]) -> Result<Vec<u8>> {
    let mut entries = Vec::new();
    for channel in channels {
        for (index, file) in channel.files().iter().enumerate() {
            let bytes = tokio::fs::read(file).await?;
            entries.push((format!("{}/{}.dcm", channel.channel_id(), index), bytes));
        }
    }

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in entries {
        zip.start_file(name, options)
            .map_err(|e| GatewayError::Io(std::io::Error::other(format!("zip entry error: {}", e))))?;
        zip.write_all(&bytes)?;
    }
    let cursor = zip
        .finish()
        .map_err(|e| GatewayError::Io(std::io::Error::other(format!("zip finish error: {}", e))))?;
    Ok(cursor.into_inner())
}

fn request_error(context: &str, err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(format!("{}: {}", context, err))
    } else {
        GatewayError::Network(format!("{}: {}", context, err))
    }
}

#[async_trait]
impl InferenceService for HttpInferenceClient {
    async fn submit(&self, work_item_id: &str, channels: &[ChannelData]) -> Result<String> {
        if channels.is_empty() {
            return Err(GatewayError::invalid_argument("Nothing to submit: no channels"));
        }

        let archive = build_archive(channels).await?;
        let mut url = self.endpoint(&["v1", "model", "start", self.model_id.as_str()])?;
        url.query_pairs_mut().append_pair("work_item_id", work_item_id);

        tracing::debug!(work_item = %work_item_id, bytes = archive.len(), "Submitting to {}", url);
        let response = self
            .authorized(self.client.post(url))
            .header(reqwest::header::CONTENT_TYPE, "application/zip")
            .body(archive)
            .send()
            .await
            .map_err(|e| request_error("inference submit failed", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| request_error("failed to read submit response", e))?;

        if status.is_success() {
            let run_id = body.trim().trim_matches('"').to_string();
            if run_id.is_empty() {
                return Err(GatewayError::InferenceRejected("empty run id in response".into()));
            }
            tracing::info!(work_item = %work_item_id, run_id = %run_id, "🧠 Submitted to inference");
            return Ok(run_id);
        }

        if status.is_client_error() {
            Err(GatewayError::InferenceRejected(format!("{}: {}", status, body.trim())))
        } else {
            Err(GatewayError::Network(format!("inference returned {}: {}", status, body.trim())))
        }
    }

    async fn poll(&self, run_id: &str, output_dir: &Path) -> Result<ModelResult> {
        let url = self.endpoint(&["v1", "model", "results", run_id])?;

        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(|e| request_error("inference poll failed", e))?;

        let status = response.status();
        match status {
            StatusCode::ACCEPTED => {
                let body = response.text().await.unwrap_or_default();
                let progress = body.trim().parse::<u8>().unwrap_or(0);
                Ok(ModelResult::in_progress(progress))
            }
            StatusCode::OK => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| request_error("failed to read result body", e))?;
                if bytes.is_empty() {
                    return Ok(ModelResult::failed(100, "inference returned an empty result"));
                }

                tokio::fs::create_dir_all(output_dir).await?;
                let path: PathBuf = output_dir.join(format!("{}.dcm", sanitize(run_id)));
                tokio::fs::write(&path, &bytes).await?;
                tracing::info!(run_id = %run_id, "Result written to {}", path.display());
                Ok(ModelResult::completed(path))
            }
            s if s.is_client_error() => {
                let body = response.text().await.unwrap_or_default();
                let reason = if body.trim().is_empty() {
                    s.to_string()
                } else {
                    body.trim().to_string()
                };
                Ok(ModelResult::failed(0, reason))
            }
            s => Err(GatewayError::Network(format!("inference poll returned {}", s))),
        }
    }
}

fn sanitize(run_id: &str) -> String {
    run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' { c } else { '_' })
        .collect()
}
