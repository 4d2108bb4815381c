use crate::core::moderation::{CategoryScores, ScoreCategory, Scorer, ScorerError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

pub const PERSPECTIVE_URL: &str =
    "https://commentanalyzer.googleapis.com/v1alpha1/comments:analyze";

fn attribute_name(category: ScoreCategory) -> &'static str {
    match category {
        ScoreCategory::Toxicity => "TOXICITY",
        ScoreCategory::SevereToxicity => "SEVERE_TOXICITY",
        ScoreCategory::IdentityAttack => "IDENTITY_ATTACK",
        ScoreCategory::Insult => "INSULT",
        ScoreCategory::Profanity => "PROFANITY",
        ScoreCategory::Threat => "THREAT",
    }
}

/// Scorer backed by the Perspective comment analyzer.
///
/// Without an API key the client is disabled: every call succeeds with 0 or
/// an empty map and nothing goes over the network.
pub struct PerspectiveScorer {
    client: Client,
    api_key: Option<String>,
    endpoint: String,
}

impl PerspectiveScorer {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Self {
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            tracing::warn!("Scorer API key not provided - external scoring disabled");
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            });

        Self {
            client,
            api_key,
            endpoint: PERSPECTIVE_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn analyze(
        &self,
        api_key: &str,
        text: &str,
        categories: &[ScoreCategory],
    ) -> Result<CategoryScores, ScorerError> {
        let requested: serde_json::Map<String, Value> = categories
            .iter()
            .map(|c| (attribute_name(*c).to_string(), json!({})))
            .collect();

        let payload = json!({
            "comment": { "text": text },
            "requestedAttributes": requested,
            "doNotStore": true,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", api_key)])
            .json(&payload)
            .send()
            .await
            .map_err(|e| ScorerError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                tracing::warn!("Scorer rate limit reached");
            }
            return Err(ScorerError::Request(format!(
                "Perspective API error: {} - {}",
                status, text
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ScorerError::InvalidResponse(e.to_string()))?;

        parse_scores(&body, categories)
    }
}

/// Pull `attributeScores.<ATTR>.summaryScore.value` for each category.
/// Missing attributes count as 0; a body without `attributeScores` is invalid.
pub fn parse_scores(
    body: &Value,
    categories: &[ScoreCategory],
) -> Result<CategoryScores, ScorerError> {
    let attributes = body
        .get("attributeScores")
        .and_then(Value::as_object)
        .ok_or_else(|| ScorerError::InvalidResponse("missing attributeScores".into()))?;

    Ok(categories
        .iter()
        .map(|category| {
            let value = attributes
                .get(attribute_name(*category))
                .and_then(|a| a["summaryScore"]["value"].as_f64())
                .unwrap_or(0.0)
                .clamp(0.0, 1.0);
            (*category, value)
        })
        .collect())
}

#[async_trait]
impl Scorer for PerspectiveScorer {
    async fn score_basic(&self, text: &str) -> Result<f64, ScorerError> {
        let Some(key) = &self.api_key else {
            return Ok(0.0);
        };
        let scores = self.analyze(key, text, &[ScoreCategory::Toxicity]).await?;
        Ok(scores.get(&ScoreCategory::Toxicity).copied().unwrap_or(0.0))
    }

    async fn score_detailed(&self, text: &str) -> Result<CategoryScores, ScorerError> {
        let Some(key) = &self.api_key else {
            return Ok(CategoryScores::new());
        };
        self.analyze(key, text, &ScoreCategory::ALL).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scores() {
        let body = json!({
            "attributeScores": {
                "TOXICITY": { "summaryScore": { "value": 0.91, "type": "PROBABILITY" } },
                "INSULT": { "summaryScore": { "value": 0.42 } }
            },
            "languages": ["en"]
        });

        let scores = parse_scores(&body, &ScoreCategory::ALL).unwrap();
        assert_eq!(scores.len(), 6);
        assert_eq!(scores[&ScoreCategory::Toxicity], 0.91);
        assert_eq!(scores[&ScoreCategory::Insult], 0.42);
        assert_eq!(scores[&ScoreCategory::Threat], 0.0);
    }

    #[test]
    fn test_parse_rejects_unexpected_body() {
        let body = json!({ "error": { "code": 400 } });
        assert!(matches!(
            parse_scores(&body, &[ScoreCategory::Toxicity]),
            Err(ScorerError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_without_key() {
        let scorer = PerspectiveScorer::new(Some("  ".into()), Duration::from_secs(1))
            .with_endpoint("http://127.0.0.1:9/unreachable");
        assert!(!scorer.is_enabled());
        assert_eq!(scorer.score_basic("anything").await.unwrap(), 0.0);
        assert!(scorer.score_detailed("anything").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let scorer = PerspectiveScorer::new(Some("key".into()), Duration::from_millis(500))
            .with_endpoint("http://127.0.0.1:9/unreachable");
        assert!(matches!(
            scorer.score_basic("hello").await,
            Err(ScorerError::Request(_))
        ));
    }
}
