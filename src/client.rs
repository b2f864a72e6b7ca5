//! Bedrock runtime client with event-stream streaming
//!
//! Posts a Messages request body to `invoke-with-response-stream` and forwards
//! decoded events over a bounded channel. Authentication uses a Bedrock API key
//! sent as a bearer token.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::BodsError;
use crate::eventstream::FrameDecoder;
use crate::models::ModelId;
use crate::profile::ProfileLister;
use crate::stream::StreamEvent;

/// Events in flight between the network task and the controller
const CHANNEL_CAPACITY: usize = 256;
/// Connection establishment limit; reading the stream itself has no deadline
const CONNECT_TIMEOUT_SECS: u64 = 30;

const EVENTSTREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";

/// Latency-optimized inference is offered for this profile in us-east-2 only
const LATENCY_OPTIMIZED_MODEL: &str = "us.anthropic.claude-3-5-haiku-20241022-v1:0";
const LATENCY_OPTIMIZED_REGION: &str = "us-east-2";

pub type EventReceiver = mpsc::Receiver<Result<StreamEvent, BodsError>>;

/// One streaming model invocation
#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Post `body` and return the event channel once the service accepted it.
    ///
    /// Errors returned here happen before any event was produced; errors sent
    /// on the channel happen mid-stream.
    async fn invoke(&self, model: &ModelId, body: Vec<u8>) -> Result<EventReceiver, BodsError>;
}

// ═══════════════════════════════════════════════════════════════
// BEDROCK
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct BedrockClient {
    http: reqwest::Client,
    region: String,
    runtime_endpoint: Url,
    control_endpoint: Url,
    token: String,
}

impl BedrockClient {
    pub fn new(region: &str, token: impl Into<String>, endpoint_override: Option<&str>) -> Result<Self, BodsError> {
        let runtime = endpoint_override
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://bedrock-runtime.{}.amazonaws.com", region));
        let runtime_endpoint = Url::parse(&runtime)
            .map_err(|e| BodsError::Config(format!("invalid endpoint URL {}: {}", runtime, e)))?;
        let control = format!("https://bedrock.{}.amazonaws.com", region);
        let control_endpoint = Url::parse(&control)
            .map_err(|e| BodsError::Config(format!("invalid region {}: {}", region, e)))?;

        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(concat!("bods/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BodsError::transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            region: region.to_string(),
            runtime_endpoint,
            control_endpoint,
            token: token.into(),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// `/model/{id}/invoke-with-response-stream`, with the id as one escaped segment
    pub fn invoke_url(&self, model: &ModelId) -> Result<Url, BodsError> {
        let mut url = self.runtime_endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| BodsError::Config(format!("endpoint {} cannot take a path", self.runtime_endpoint)))?
            .pop_if_empty()
            .push("model")
            .push(model.as_str())
            .push("invoke-with-response-stream");
        Ok(url)
    }

    fn latency_optimized(&self, model: &ModelId) -> bool {
        model.as_str() == LATENCY_OPTIMIZED_MODEL && self.region == LATENCY_OPTIMIZED_REGION
    }

    /// System-defined inference profile ids visible in this region
    pub async fn list_inference_profiles(&self) -> Result<Vec<String>, BodsError> {
        let mut ids = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut url = self.control_endpoint.clone();
            url.set_path("/inference-profiles");
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("maxResults", "1000").append_pair("type", "SYSTEM_DEFINED");
                if let Some(token) = &next_token {
                    query.append_pair("nextToken", token);
                }
            }

            let response = self
                .http
                .get(url)
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| BodsError::transport(format!("failed to list inference profiles: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(BodsError::transport(format!("API error {}: {}", status, body)));
            }

            let page: ProfilePage = response
                .json()
                .await
                .map_err(|e| BodsError::transport(format!("failed to parse inference profiles: {}", e)))?;

            ids.extend(page.inference_profile_summaries.into_iter().map(|p| p.inference_profile_id));
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        tracing::debug!("{} inference profiles in {}", ids.len(), self.region);
        Ok(ids)
    }
}

#[async_trait]
impl ModelTransport for BedrockClient {
    async fn invoke(&self, model: &ModelId, body: Vec<u8>) -> Result<EventReceiver, BodsError> {
        let url = self.invoke_url(model)?;
        tracing::debug!(%url, bytes = body.len(), "invoking model");

        let mut request = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, EVENTSTREAM_CONTENT_TYPE)
            .header("X-Amzn-Bedrock-Accept", "application/json")
            .body(body);
        if self.latency_optimized(model) {
            request = request.header("X-Amzn-Bedrock-PerformanceConfig-Latency", "optimized");
        }

        let response = request
            .send()
            .await
            .map_err(|e| BodsError::transport(format!("failed to connect to Bedrock: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BodsError::transport(format!("API error {}: {}", status, body)));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            if let Err(e) = pump(response, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl ProfileLister for BedrockClient {
    async fn list_profiles(&self) -> Result<Vec<String>, BodsError> {
        self.list_inference_profiles().await
    }
}

/// Forward frames until the body ends or the receiver goes away
async fn pump(
    response: reqwest::Response,
    tx: &mpsc::Sender<Result<StreamEvent, BodsError>>,
) -> Result<(), BodsError> {
    let mut bytes_stream = response.bytes_stream();
    let mut decoder = FrameDecoder::new();

    loop {
        let chunk = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("event receiver dropped, closing stream");
                return Ok(());
            }
            chunk = bytes_stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.map_err(|e| BodsError::transport(format!("stream read error: {}", e)))?;
        decoder.push(&chunk);

        while let Some(frame) = decoder.next_frame()? {
            if let Some(event) = frame.into_event()? {
                if tx.send(Ok(event)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    if decoder.pending() > 0 {
        return Err(BodsError::protocol(format!(
            "stream ended inside a frame ({} bytes pending)",
            decoder.pending()
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
// API Types
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfilePage {
    #[serde(default)]
    inference_profile_summaries: Vec<ProfileSummary>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileSummary {
    inference_profile_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_url_escapes_model_id() {
        let client = BedrockClient::new("us-west-2", "token", None).unwrap();
        let url = client
            .invoke_url(&ModelId::new("us.anthropic.claude-3-7-sonnet-20250219-v1:0"))
            .unwrap();
        assert_eq!(url.host_str(), Some("bedrock-runtime.us-west-2.amazonaws.com"));
        assert_eq!(
            url.path(),
            "/model/us.anthropic.claude-3-7-sonnet-20250219-v1:0/invoke-with-response-stream"
        );
    }

    #[test]
    fn test_endpoint_override() {
        let client = BedrockClient::new("us-east-1", "token", Some("http://localhost:4566/")).unwrap();
        let url = client.invoke_url(&ModelId::default()).unwrap();
        assert!(url.as_str().starts_with("http://localhost:4566/model/"));
        assert!(BedrockClient::new("us-east-1", "t", Some("not a url")).is_err());
    }

    #[test]
    fn test_latency_optimized_only_for_haiku_in_ohio() {
        let ohio = BedrockClient::new("us-east-2", "t", None).unwrap();
        assert!(ohio.latency_optimized(&ModelId::new(LATENCY_OPTIMIZED_MODEL)));
        assert!(!ohio.latency_optimized(&ModelId::default()));
        let virginia = BedrockClient::new("us-east-1", "t", None).unwrap();
        assert!(!virginia.latency_optimized(&ModelId::new(LATENCY_OPTIMIZED_MODEL)));
    }

    #[test]
    fn test_parse_profile_page() {
        let json = r#"{"inferenceProfileSummaries":[{"inferenceProfileId":"us.anthropic.claude-3-7-sonnet-20250219-v1:0","status":"ACTIVE"}],"nextToken":null}"#;
        let page: ProfilePage = serde_json::from_str(json).unwrap();
        assert_eq!(page.inference_profile_summaries.len(), 1);
        assert!(page.next_token.is_none());
    }
}
