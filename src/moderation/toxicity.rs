use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scores at or above this are toxic.
pub const TOXIC_CUTOFF: f64 = 0.5;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier is not configured")]
    Unavailable,

    #[error("classifier request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected classifier response: {0}")]
    Response(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToxicityLevel {
    Safe,
    Mild,
    Moderate,
    High,
    Severe,
    Unknown,
}

impl ToxicityLevel {
    pub fn from_score(score: f64) -> ToxicityLevel {
        use ToxicityLevel::*;
        match score {
            s if s < 0.2 => Safe,
            s if s < 0.4 => Mild,
            s if s < 0.6 => Moderate,
            s if s < 0.8 => High,
            _ => Severe,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToxicityScores {
    pub toxicity: f64,
    pub severe_toxicity: f64,
    pub obscene: f64,
    pub threat: f64,
    pub insult: f64,
    pub identity_attack: f64,
    pub is_toxic: bool,
    pub toxicity_level: ToxicityLevel,
}

impl ToxicityScores {
    /// Scores for a single overall toxicity value; sub-scores stay at zero.
    pub fn from_toxicity(toxicity: f64) -> ToxicityScores {
        let toxicity = (toxicity.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0;
        ToxicityScores {
            toxicity,
            is_toxic: toxicity >= TOXIC_CUTOFF,
            toxicity_level: ToxicityLevel::from_score(toxicity),
            ..ToxicityScores::default()
        }
    }
}

/// All-zero scores used whenever the classifier can't answer.
impl Default for ToxicityScores {
    fn default() -> Self {
        ToxicityScores {
            toxicity: 0.0,
            severe_toxicity: 0.0,
            obscene: 0.0,
            threat: 0.0,
            insult: 0.0,
            identity_attack: 0.0,
            is_toxic: false,
            toxicity_level: ToxicityLevel::Unknown,
        }
    }
}

#[async_trait]
pub trait ToxicityClassifier: Send + Sync {
    async fn analyze(&self, text: &str) -> Result<ToxicityScores, ClassifierError>;
}

/// Runs the classifier under `timeout`, falling back to default scores on any failure.
pub async fn score_or_default(
    classifier: &dyn ToxicityClassifier,
    text: &str,
    timeout: Duration,
) -> ToxicityScores {
    let result = match tokio::time::timeout(timeout, classifier.analyze(text)).await {
        Ok(result) => result,
        Err(_) => Err(ClassifierError::Timeout(timeout)),
    };

    match result {
        Ok(scores) => scores,
        Err(ClassifierError::Unavailable) => ToxicityScores::default(),
        Err(e) => {
            tracing::warn!(error = %e, "toxicity analysis failed, using default scores");
            ToxicityScores::default()
        }
    }
}

/// Used when no classifier endpoint is configured.
pub struct DisabledClassifier;

#[async_trait]
impl ToxicityClassifier for DisabledClassifier {
    async fn analyze(&self, _text: &str) -> Result<ToxicityScores, ClassifierError> {
        Err(ClassifierError::Unavailable)
    }
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
}

#[derive(Debug, Deserialize)]
struct LabelScore {
    label: String,
    score: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InferenceResponse {
    Flat(Vec<LabelScore>),
    Nested(Vec<Vec<LabelScore>>),
}

impl InferenceResponse {
    fn top(self) -> Option<LabelScore> {
        match self {
            InferenceResponse::Flat(labels) => labels.into_iter().next(),
            InferenceResponse::Nested(batches) => batches.into_iter().next()?.into_iter().next(),
        }
    }
}

/// Text-classification model served over HTTP.
///
/// Posts `{"inputs": text}` and reads back the top `{label, score}` pair.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>) -> Result<HttpClassifier, ClassifierError> {
        let client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(HttpClassifier {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ToxicityClassifier for HttpClassifier {
    async fn analyze(&self, text: &str) -> Result<ToxicityScores, ClassifierError> {
        let response: InferenceResponse = self.client.post(&self.endpoint)
            .json(&InferenceRequest { inputs: text })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let top = response
            .top()
            .ok_or_else(|| ClassifierError::Response("empty prediction list".to_owned()))?;

        Ok(ToxicityScores::from_toxicity(toxicity_from_label(&top.label, top.score)))
    }
}

/// Maps a binary classifier's winning label onto a toxicity probability.
fn toxicity_from_label(label: &str, score: f64) -> f64 {
    match label {
        "LABEL_1" | "toxic" => score,
        "LABEL_0" | "non-toxic" => 1.0 - score,
        other => {
            let other = other.to_lowercase();
            if other.contains("toxic") && !other.contains("non") {
                score
            } else {
                1.0 - score
            }
        }
    }
}
