//! Log analysis - asks a local model which log lines are errors
//!
//! Best effort only: any failure turns into "no highlighting" for the
//! dashboard, never into a failed log fetch.

use crate::logs::strip_ansi;
use crate::settings::AnalyzerSettings;
use async_trait::async_trait;
use perch_core::AnalyzeReply;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("analysis request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("analysis backend returned HTTP {0}")]
    Status(u16),

    #[error("could not read line numbers from model reply")]
    Malformed,
}

#[async_trait]
pub trait LogAnalyzer: Send + Sync {
    fn enabled(&self) -> bool;

    /// Indices into `lines` that look like errors.
    async fn error_lines(&self, lines: &[String]) -> Result<Vec<usize>, AnalyzeError>;
}

/// Used when no backend is configured
pub struct DisabledAnalyzer;

#[async_trait]
impl LogAnalyzer for DisabledAnalyzer {
    fn enabled(&self) -> bool {
        false
    }

    async fn error_lines(&self, _lines: &[String]) -> Result<Vec<usize>, AnalyzeError> {
        Ok(Vec::new())
    }
}

/// Ollama `/api/generate` client
pub struct OllamaAnalyzer {
    client: reqwest::Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaAnalyzer {
    pub fn new(url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self, AnalyzeError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl LogAnalyzer for OllamaAnalyzer {
    fn enabled(&self) -> bool {
        true
    }

    async fn error_lines(&self, lines: &[String]) -> Result<Vec<usize>, AnalyzeError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(lines),
            stream: false,
        };
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AnalyzeError::Status(response.status().as_u16()));
        }
        let body: GenerateResponse = response.json().await?;
        parse_line_numbers(&body.response).ok_or(AnalyzeError::Malformed)
    }
}

/// Pick an analyzer from settings. A backend that can't be built is logged
/// and treated as disabled.
pub fn from_settings(settings: &AnalyzerSettings) -> Box<dyn LogAnalyzer> {
    if !settings.enabled {
        return Box::new(DisabledAnalyzer);
    }
    match OllamaAnalyzer::new(&settings.url, &settings.model, settings.timeout()) {
        Ok(analyzer) => {
            tracing::info!(url = %settings.url, model = %settings.model, "Log analysis enabled");
            Box::new(analyzer)
        }
        Err(e) => {
            tracing::warn!("Log analysis disabled: {}", e);
            Box::new(DisabledAnalyzer)
        }
    }
}

/// Run an analysis and shape the reply. Indices outside `lines` are dropped.
pub async fn analyze(analyzer: &dyn LogAnalyzer, lines: &[String]) -> AnalyzeReply {
    if !analyzer.enabled() {
        return AnalyzeReply::disabled();
    }
    if lines.is_empty() {
        return AnalyzeReply::lines(Vec::new());
    }
    match analyzer.error_lines(lines).await {
        Ok(mut found) => {
            found.retain(|&i| i < lines.len());
            found.sort_unstable();
            found.dedup();
            AnalyzeReply::lines(found)
        }
        Err(e) => {
            tracing::warn!("Log analysis failed: {}", e);
            AnalyzeReply::failed(e.to_string())
        }
    }
}

fn build_prompt(lines: &[String]) -> String {
    let mut prompt = String::from(
        "Below is the output of a development server, one numbered line per row.\n\
         Reply with ONLY a JSON array of the line numbers that are errors or \
         stack-trace lines belonging to an error, e.g. [3, 4, 5]. Reply [] if \
         there are none.\n\n",
    );
    for (i, line) in lines.iter().enumerate() {
        prompt.push_str(&format!("{i}: {}\n", strip_ansi(line)));
    }
    prompt
}

/// First JSON array of non-negative integers in `reply`
fn parse_line_numbers(reply: &str) -> Option<Vec<usize>> {
    let mut rest = reply;
    while let Some(start) = rest.find('[') {
        let candidate = &rest[start..];
        if let Some(end) = candidate.find(']') {
            if let Ok(numbers) = serde_json::from_str::<Vec<usize>>(&candidate[..=end]) {
                return Some(numbers);
            }
        }
        rest = &candidate[1..];
    }
    None
}
