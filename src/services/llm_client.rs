// LLM collaborator interface.
//
// Each method performs exactly one call to the text-generation gateway and
// decodes its structured output. No retries live here: timeout and repair
// policy are owned by the orchestrator.

use reqwest::Client as HttpClient;
use serde_json::json;
use std::collections::BTreeMap;

use crate::config::LlmConfig;
use crate::pipeline::types::ErrorCode;

/// Collaborator failure. All variants are ordinary stage failures, never
/// unhandled faults.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("LLM call timed out")]
    Timeout,
    #[error("LLM returned malformed output: {0}")]
    BadOutput(String),
    #[error("LLM transport error: {0}")]
    Transport(String),
}

impl LlmError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            LlmError::Timeout => ErrorCode::LlmTimeout,
            LlmError::BadOutput(_) => ErrorCode::LlmBadOutput,
            LlmError::Transport(_) => ErrorCode::LlmTransport,
        }
    }
}

/// The stage the repair collaborator is asked to fix; determines both the
/// prompt shape and the kind of artifact returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTarget {
    Plan,
    Sql,
}

#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Detect ambiguities; one clarification question per ambiguity found.
    async fn detect(&self, question: &str, schema: &str) -> Result<Vec<String>, LlmError>;

    /// Produce a short natural-language query plan.
    async fn plan(&self, question: &str, schema: &str) -> Result<String, LlmError>;

    /// Generate SQL plus a rationale from the question, schema and plan.
    async fn generate(
        &self,
        question: &str,
        schema: &str,
        plan: &str,
        clarify_answers: &BTreeMap<String, String>,
    ) -> Result<(String, String), LlmError>;

    /// Judge whether the executed result plausibly answers the question.
    async fn verify(
        &self,
        question: &str,
        sql: &str,
        columns: &[String],
        row_count: usize,
    ) -> Result<(bool, Option<String>), LlmError>;

    /// Revise a failed artifact given the error text and schema.
    async fn repair(
        &self,
        target: RepairTarget,
        artifact: &str,
        error_text: &str,
        schema: &str,
    ) -> Result<String, LlmError>;
}

/// HTTP gateway client. Posts a prompt, expects a JSON body whose text field
/// contains the stage-specific JSON contract.
pub struct HttpLlmClient {
    gateway_url: String,
    api_key: Option<String>,
    http_client: HttpClient,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            gateway_url: config.gateway_url.clone(),
            api_key: config.api_key.clone(),
            http_client: HttpClient::new(),
        }
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let mut request = self.http_client.post(&self.gateway_url).json(&json!({
            "prompt": prompt,
            "max_tokens": max_tokens,
            "temperature": 0.1,
        }));

        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Transport(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Transport(format!(
                "gateway returned {}: {}",
                status, body
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::BadOutput(format!("unparseable gateway body: {}", e)))?;

        let text = payload["text"]
            .as_str()
            .or_else(|| payload["content"].as_str())
            .or_else(|| payload["response"].as_str())
            .ok_or_else(|| LlmError::BadOutput("gateway body has no text field".to_string()))?;

        Ok(strip_code_fences(text))
    }

    fn parse_json(text: &str) -> Result<serde_json::Value, LlmError> {
        serde_json::from_str(text)
            .map_err(|e| LlmError::BadOutput(format!("expected JSON payload: {} in {:?}", e, text)))
    }
}

/// Gateways frequently wrap structured output in markdown fences.
fn strip_code_fences(text: &str) -> String {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```sql")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
        .to_string()
}

#[async_trait::async_trait]
impl LlmClient for HttpLlmClient {
    async fn detect(&self, question: &str, schema: &str) -> Result<Vec<String>, LlmError> {
        let prompt = format!(
            "You review natural-language database questions for ambiguity.\n\
             Schema:\n{schema}\n\nQuestion: {question}\n\n\
             Respond with JSON: {{\"questions\": [\"...\"]}} listing one \
             clarification question per genuine ambiguity, or an empty list."
        );
        let text = self.complete(&prompt, 300).await?;
        let value = Self::parse_json(&text)?;
        let questions = value["questions"]
            .as_array()
            .ok_or_else(|| LlmError::BadOutput("missing questions array".to_string()))?
            .iter()
            .filter_map(|q| q.as_str().map(|s| s.to_string()))
            .collect();
        Ok(questions)
    }

    async fn plan(&self, question: &str, schema: &str) -> Result<String, LlmError> {
        let prompt = format!(
            "You plan SQL queries. Schema:\n{schema}\n\nQuestion: {question}\n\n\
             Respond with JSON: {{\"plan\": \"numbered steps describing tables, \
             joins, filters and ordering\"}}."
        );
        let text = self.complete(&prompt, 400).await?;
        let value = Self::parse_json(&text)?;
        let plan = value["plan"]
            .as_str()
            .ok_or_else(|| LlmError::BadOutput("missing plan field".to_string()))?;
        if plan.trim().is_empty() {
            return Err(LlmError::BadOutput("empty plan".to_string()));
        }
        Ok(plan.to_string())
    }

    async fn generate(
        &self,
        question: &str,
        schema: &str,
        plan: &str,
        clarify_answers: &BTreeMap<String, String>,
    ) -> Result<(String, String), LlmError> {
        let mut clarifications = String::new();
        for (topic, answer) in clarify_answers {
            clarifications.push_str(&format!("- {}: {}\n", topic, answer));
        }
        let prompt = format!(
            "You write a single SQLite SELECT statement.\n\
             Schema:\n{schema}\n\nQuestion: {question}\n\nPlan:\n{plan}\n\n\
             Clarifications:\n{clarifications}\n\
             Respond with JSON: {{\"sql\": \"SELECT ...\", \"rationale\": \"...\"}}. \
             The SQL must be SELECT-only, a single statement, with a LIMIT where \
             the result set could be large."
        );
        let text = self.complete(&prompt, 600).await?;
        let value = Self::parse_json(&text)?;
        let sql = value["sql"]
            .as_str()
            .ok_or_else(|| LlmError::BadOutput("missing sql field".to_string()))?;
        if sql.trim().is_empty() {
            return Err(LlmError::BadOutput("empty sql".to_string()));
        }
        let rationale = value["rationale"].as_str().unwrap_or("").to_string();
        Ok((sql.trim().to_string(), rationale))
    }

    async fn verify(
        &self,
        question: &str,
        sql: &str,
        columns: &[String],
        row_count: usize,
    ) -> Result<(bool, Option<String>), LlmError> {
        let prompt = format!(
            "A SQL query was executed to answer a question.\n\
             Question: {question}\nSQL: {sql}\n\
             Result columns: {}\nRow count: {row_count}\n\n\
             Respond with JSON: {{\"verified\": true|false, \"reason\": \"...\"}} \
             judging whether the result plausibly answers the question.",
            columns.join(", ")
        );
        let text = self.complete(&prompt, 200).await?;
        let value = Self::parse_json(&text)?;
        let verified = value["verified"]
            .as_bool()
            .ok_or_else(|| LlmError::BadOutput("missing verified field".to_string()))?;
        let reason = value["reason"].as_str().map(|s| s.to_string());
        Ok((verified, reason))
    }

    async fn repair(
        &self,
        target: RepairTarget,
        artifact: &str,
        error_text: &str,
        schema: &str,
    ) -> Result<String, LlmError> {
        let (kind, field, guidelines) = match target {
            RepairTarget::Plan => (
                "query plan",
                "plan",
                "Rewrite the plan so it only references tables and columns in the schema.",
            ),
            RepairTarget::Sql => (
                "SQL statement",
                "sql",
                "Keep the query SELECT-only, a single statement. Qualify ambiguous \
                 columns, match GROUP BY fields with aggregations, and add a \
                 reasonable LIMIT if missing.",
            ),
        };
        let prompt = format!(
            "A {kind} failed and must be corrected.\n\
             Schema:\n{schema}\n\nFailed artifact:\n{artifact}\n\n\
             Error:\n{error_text}\n\n{guidelines}\n\
             Respond with JSON: {{\"{field}\": \"...\"}}."
        );
        let text = self.complete(&prompt, 600).await?;
        let value = Self::parse_json(&text)?;
        let revised = value[field]
            .as_str()
            .ok_or_else(|| LlmError::BadOutput(format!("missing {} field", field)))?;
        if revised.trim().is_empty() {
            return Err(LlmError::BadOutput("empty repair output".to_string()));
        }
        Ok(revised.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(
            strip_code_fences("```sql\nSELECT 1\n```"),
            "SELECT 1"
        );
        assert_eq!(
            strip_code_fences("```json\n{\"sql\": \"SELECT 1\"}\n```"),
            "{\"sql\": \"SELECT 1\"}"
        );
        assert_eq!(strip_code_fences("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn test_llm_error_maps_to_error_codes() {
        assert_eq!(LlmError::Timeout.error_code(), ErrorCode::LlmTimeout);
        assert_eq!(
            LlmError::BadOutput("x".to_string()).error_code(),
            ErrorCode::LlmBadOutput
        );
        assert_eq!(
            LlmError::Transport("x".to_string()).error_code(),
            ErrorCode::LlmTransport
        );
    }
}
