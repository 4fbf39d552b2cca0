//! Challenge-solving capability: black-box audio transcription or site-key
//! token services reached over HTTP.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::config::SolverConfig;
use crate::error::{BellhopError, Result};

static NON_ALPHANUMERIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9 ]+").expect("static regex"));

/// What the challenge widget exposed for solving.
#[derive(Debug, Clone, PartialEq)]
pub enum ChallengePayload {
	/// Audio sub-challenge: a URL to the spoken payload, transcribed to text.
	AudioUrl(String),
	/// No audio exposed: solve by site key for an injectable token.
	SiteKey { page_url: String, site_key: String },
}

/// Black-box solver turning a challenge payload into submittable text or a
/// token. May fail (`SolverUnavailable`) or time out (`SolverTimeout`).
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
	async fn solve(&self, payload: &ChallengePayload) -> Result<String>;
}

/// HTTP-backed [`ChallengeSolver`] using the configured transcription and
/// token endpoints.
pub struct HttpSolver {
	client: reqwest::Client,
	config: SolverConfig,
}

impl HttpSolver {
	pub fn new(config: SolverConfig) -> Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(60))
			.build()
			.map_err(|e| BellhopError::SolverUnavailable(e.to_string()))?;
		Ok(Self { client, config })
	}

	async fn transcribe(&self, audio_url: &str) -> Result<String> {
		let endpoint = self
			.config
			.transcribe_endpoint
			.as_deref()
			.ok_or_else(|| BellhopError::SolverUnavailable("no transcription endpoint configured".into()))?;

		let audio = self
			.client
			.get(audio_url)
			.send()
			.await
			.map_err(map_transport)?
			.error_for_status()
			.map_err(|e| BellhopError::SolverUnavailable(format!("audio fetch failed: {e}")))?
			.bytes()
			.await
			.map_err(map_transport)?;

		let mut request = self.client.post(endpoint).header("content-type", "audio/wav").body(audio.to_vec());
		if let Some(key) = &self.config.api_key {
			request = request.bearer_auth(key);
		}
		let response: Value = request
			.send()
			.await
			.map_err(map_transport)?
			.error_for_status()
			.map_err(|e| BellhopError::SolverUnavailable(e.to_string()))?
			.json()
			.await
			.map_err(map_transport)?;

		let text = response
			.get("text")
			.and_then(Value::as_str)
			.ok_or_else(|| BellhopError::SolverUnavailable("transcription response had no text".into()))?;
		let cleaned = NON_ALPHANUMERIC.replace_all(text, "").trim().to_string();
		if cleaned.is_empty() {
			return Err(BellhopError::SolverUnavailable("transcription produced no usable text".into()));
		}
		debug!(target = "bellhop.auth", chars = cleaned.len(), "audio challenge transcribed");
		Ok(cleaned)
	}

	async fn token_for_site(&self, page_url: &str, site_key: &str) -> Result<String> {
		let endpoint = self
			.config
			.token_endpoint
			.as_deref()
			.ok_or_else(|| BellhopError::SolverUnavailable("no token endpoint configured".into()))?;

		let mut request = self.client.get(endpoint).query(&[("site", page_url), ("sitekey", site_key)]);
		if let Some(key) = &self.config.api_key {
			request = request.header("x-api-key", key);
		}
		let response: Value = request
			.send()
			.await
			.map_err(map_transport)?
			.error_for_status()
			.map_err(|e| BellhopError::SolverUnavailable(e.to_string()))?
			.json()
			.await
			.map_err(map_transport)?;

		match response.get("result").and_then(Value::as_str) {
			Some(token) if !token.is_empty() => Ok(token.to_string()),
			_ => Err(BellhopError::SolverUnavailable("token service returned no result".into())),
		}
	}
}

#[async_trait]
impl ChallengeSolver for HttpSolver {
	async fn solve(&self, payload: &ChallengePayload) -> Result<String> {
		match payload {
			ChallengePayload::AudioUrl(url) => self.transcribe(url).await,
			ChallengePayload::SiteKey { page_url, site_key } => self.token_for_site(page_url, site_key).await,
		}
	}
}

fn map_transport(err: reqwest::Error) -> BellhopError {
	if err.is_timeout() {
		BellhopError::SolverTimeout
	} else {
		BellhopError::SolverUnavailable(err.to_string())
	}
}
