use crate::chunking::approx_token_count;
use crate::embeddings::LlmCapability;
use crate::error::CapabilityError;
use crate::models::{Format, MaterialMetadata};
use crate::retry::{with_retry, RetryPolicy};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const MAX_TOPICS: usize = 5;
const HEAD_BUDGET_SHARE: f64 = 0.7;

fn build_prompt(text: &str, format: Format) -> String {
    format!(
        "You are an archivist. Read the following {format} document and answer with strict JSON \
        only, no prose, using this shape: \
        {{\"doc_type\": string, \"topics\": [3 to 5 short strings], \"summary\": string (<= 3 sentences)}}\n\
        \n\
        Document:\n{text}"
    )
}

fn truncate_head_tail(text: &str, budget_tokens: usize) -> String {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() <= budget_tokens {
        return text.to_string();
    }

    let head = (budget_tokens as f64 * HEAD_BUDGET_SHARE) as usize;
    let tail = budget_tokens.saturating_sub(head);
    let mut out = tokens[..head].join(" ");
    out.push_str("\n[...]\n");
    out.push_str(&tokens[tokens.len() - tail..].join(" "));
    out
}

#[derive(Debug, Deserialize)]
struct MetadataPayload {
    doc_type: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    summary: Option<String>,
}

fn parse_response(raw: &str) -> Result<MaterialMetadata, CapabilityError> {
    // Models wrap JSON in code fences more often than not.
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let payload: MetadataPayload = serde_json::from_str(trimmed)
        .map_err(|error| CapabilityError::Malformed(format!("metadata json: {error}")))?;

    let mut topics = payload.topics;
    topics.retain(|topic| !topic.trim().is_empty());
    topics.truncate(MAX_TOPICS);

    Ok(MaterialMetadata {
        doc_type: payload
            .doc_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string()),
        topics,
        summary: payload.summary.unwrap_or_default(),
    })
}

/// Metadata is enrichment: every failure path degrades to the default and
/// never fails the ingestion.
pub async fn extract_metadata(
    llm: &dyn LlmCapability,
    text: &str,
    format: Format,
    policy: &RetryPolicy,
    budget_tokens: usize,
    deadline: Duration,
) -> MaterialMetadata {
    if approx_token_count(text) == 0 {
        return MaterialMetadata::degraded();
    }

    let sampled = truncate_head_tail(text, budget_tokens);
    let prompt = build_prompt(&sampled, format);

    let outcome = with_retry(policy, "metadata", || async {
        let raw = llm.complete(&prompt, deadline).await?;
        parse_response(&raw)
    })
    .await;

    match outcome {
        Ok(metadata) => metadata,
        Err(error) => {
            warn!(%error, "metadata extraction degraded to default");
            MaterialMetadata::degraded()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedLlm {
        response: Result<String, fn() -> CapabilityError>,
        calls: AtomicU32,
    }

    impl ScriptedLlm {
        fn answering(response: &str) -> Self {
            Self {
                response: Ok(response.to_string()),
                calls: AtomicU32::new(0),
            }
        }

        fn failing(make: fn() -> CapabilityError) -> Self {
            Self {
                response: Err(make),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmCapability for ScriptedLlm {
        async fn complete(
            &self,
            _prompt: &str,
            _deadline: Duration,
        ) -> Result<String, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(text) => Ok(text.clone()),
                Err(make) => Err(make()),
            }
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
            unimplemented!("not used in metadata tests")
        }

        fn embedding_dimensions(&self) -> usize {
            8
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(2),
        )
    }

    #[tokio::test]
    async fn well_formed_response_is_parsed() {
        let llm = ScriptedLlm::answering(
            r#"```json
{"doc_type": "manual", "topics": ["pumps", "maintenance", "safety"], "summary": "A pump manual."}
```"#,
        );
        let metadata = extract_metadata(
            &llm,
            "pump manual text",
            Format::Pdf,
            &fast_policy(),
            100,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(metadata.doc_type, "manual");
        assert_eq!(metadata.topics.len(), 3);
        assert_eq!(metadata.summary, "A pump manual.");
    }

    #[tokio::test]
    async fn topics_are_clamped_to_five() {
        let llm = ScriptedLlm::answering(
            r#"{"doc_type": "report", "topics": ["a","b","c","d","e","f","g"], "summary": ""}"#,
        );
        let metadata = extract_metadata(
            &llm,
            "some text",
            Format::Csv,
            &fast_policy(),
            100,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(metadata.topics.len(), 5);
    }

    #[tokio::test]
    async fn malformed_response_degrades_after_retries() {
        let llm = ScriptedLlm::answering("I would rather chat about the weather.");
        let metadata = extract_metadata(
            &llm,
            "some text",
            Format::Docx,
            &fast_policy(),
            100,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(metadata, MaterialMetadata::degraded());
        // Malformed is fatal per taxonomy: one attempt, no retry loop.
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_degrade() {
        let llm =
            ScriptedLlm::failing(|| CapabilityError::RateLimited("429".to_string()));
        let metadata = extract_metadata(
            &llm,
            "some text",
            Format::Xlsx,
            &fast_policy(),
            100,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(metadata, MaterialMetadata::degraded());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn truncation_keeps_head_and_tail() {
        let words: Vec<String> = (0..200).map(|i| format!("w{i}")).collect();
        let text = words.join(" ");
        let sampled = truncate_head_tail(&text, 50);
        assert!(sampled.starts_with("w0 "));
        assert!(sampled.ends_with("w199"));
        assert!(approx_token_count(&sampled) <= 52);
    }

    #[test]
    fn short_documents_are_not_truncated() {
        let text = "just a few words";
        assert_eq!(truncate_head_tail(text, 100), text);
    }
}
