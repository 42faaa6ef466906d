use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use shared::SandboxError;

use crate::models::report::{FuzzyMatch, SignatureHit};
use crate::models::task::SampleRef;

/// Static signature-matching collaborator, consumed as a black box
#[async_trait]
pub trait SignatureClient: Send + Sync {
    async fn match_sample(&self, sample: &SampleRef) -> Result<Vec<SignatureHit>, SandboxError>;
}

/// Fuzzy-hash similarity collaborator, consumed as a black box
#[async_trait]
pub trait FuzzyHashClient: Send + Sync {
    async fn similar_samples(&self, sample: &SampleRef) -> Result<Vec<FuzzyMatch>, SandboxError>;
}

#[derive(Debug, Serialize)]
struct IntelQuery<'a> {
    sha256: &'a str,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct SignatureResponse {
    matches: Vec<SignatureHit>,
}

#[derive(Debug, Deserialize)]
struct FuzzyResponse {
    matches: Vec<FuzzyMatch>,
}

/// HTTP client for both intel services
pub struct HttpIntelClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIntelClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, SandboxError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SandboxError::ExternalService(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn post_query<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        sample: &SampleRef,
    ) -> Result<T, SandboxError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        debug!(%url, sha256 = %sample.sha256, "Querying intel service");

        let response = self
            .client
            .post(&url)
            .json(&IntelQuery {
                sha256: &sample.sha256,
                size: sample.size,
            })
            .send()
            .await
            .map_err(|e| SandboxError::ExternalService(format!("{}: {}", path, e)))?;

        if !response.status().is_success() {
            return Err(SandboxError::ExternalService(format!(
                "{} returned {}",
                path,
                response.status()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SandboxError::ExternalService(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl SignatureClient for HttpIntelClient {
    async fn match_sample(&self, sample: &SampleRef) -> Result<Vec<SignatureHit>, SandboxError> {
        let response: SignatureResponse = self.post_query("signatures/match", sample).await?;
        Ok(response.matches)
    }
}

#[async_trait]
impl FuzzyHashClient for HttpIntelClient {
    async fn similar_samples(&self, sample: &SampleRef) -> Result<Vec<FuzzyMatch>, SandboxError> {
        let response: FuzzyResponse = self.post_query("fuzzy/similar", sample).await?;
        Ok(response.matches)
    }
}

/// Stand-in when no intel endpoint is configured: every lookup is empty
pub struct NullIntelClient;

#[async_trait]
impl SignatureClient for NullIntelClient {
    async fn match_sample(&self, _sample: &SampleRef) -> Result<Vec<SignatureHit>, SandboxError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl FuzzyHashClient for NullIntelClient {
    async fn similar_samples(&self, _sample: &SampleRef) -> Result<Vec<FuzzyMatch>, SandboxError> {
        Ok(Vec::new())
    }
}
