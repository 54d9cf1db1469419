//! Extraction client: asks the model for KPI records, one chunk at a time.
//!
//! The OpenAI client uses Structured Outputs (JSON Schema, strict) on the
//! Responses API. The schema is generated from [`ExtractionPayload`] so the
//! model contract and the parser cannot drift apart.
//!
//! Outcomes per chunk:
//! - no structured answer at all (refusal, empty output) → [`ExtractError::ContractNotInvoked`]
//! - an answer that does not match the record schema → [`ExtractError::Schema`]
//! - zero records → `Ok(vec![])`, which is normal for most chunks

use std::collections::HashSet;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::chunk::render_chunk;
use crate::config::LlmConfig;
use crate::error::ExtractError;
use crate::record::CandidateRecord;
use crate::table::TableChunk;

pub const SYSTEM_PROMPT: &str = "You are a finance assistant and a precise information extraction engine. \
    You receive (1) a markdown table cut from a spreadsheet and (2) a list of KPI names to extract. \
    You ONLY return JSON that matches the provided JSON Schema. \
    Row numbers come from the table's `row` column and column numbers from the `(col N)` labels; never count rows yourself.";

const INSTRUCTION: &str = "Task:\n\
    - Find every table row whose label matches one of the KPI names (case-insensitive).\n\
    - For each value cell of such a row, return one record:\n\
      - name: the KPI name as written in the KPI list.\n\
      - value: the cell content exactly as shown (number or string), no unit conversion.\n\
      - header: the header of that cell's column (the period), without the \"(col N)\" suffix.\n\
      - row: the number in the `row` column of that line.\n\
      - column: the N from the \"(col N)\" label of that cell's column.\n\
    - If none of the KPIs appear in this table, return {\"kpis\": []}.\n\
    Return JSON EXACTLY matching the provided schema. Do NOT include extra keys.";

/// Source of candidate records for one chunk.
///
/// Implementations must be shareable across threads: the coordinator may
/// dispatch chunks of one file concurrently.
pub trait KpiExtractor: Send + Sync {
    fn extract(&self, chunk: &TableChunk, kpis: &[String]) -> Result<Vec<CandidateRecord>, ExtractError>;
}

/// Top-level object the model must return.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExtractionPayload {
    /// One entry per KPI value found in the table.
    pub kpis: Vec<CandidateRecord>,
}

/// Strict JSON Schema for [`ExtractionPayload`].
pub fn payload_schema() -> Result<Value, serde_json::Error> {
    let generator = SchemaSettings::draft07()
        .with(|s| s.inline_subschemas = true)
        .into_generator();
    let root = generator.into_root_schema_for::<ExtractionPayload>();
    let mut schema = serde_json::to_value(root)?;
    enforce_strict_schema(&mut schema);
    Ok(schema)
}

/// Rewrites a generated schema into the subset accepted by strict Structured
/// Outputs: closed objects, every property required (optional ones stay
/// nullable), no annotation keywords.
pub fn enforce_strict_schema(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            for key in ["$schema", "title", "format", "default", "definitions"] {
                map.remove(key);
            }
            let is_object_type = map
                .get("type")
                .and_then(|t| t.as_str())
                .map(|t| t == "object")
                .unwrap_or(false)
                || map.contains_key("properties");
            if is_object_type {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
                let required: Vec<Value> = map
                    .get("properties")
                    .and_then(|p| p.as_object())
                    .map(|props| props.keys().cloned().map(Value::String).collect())
                    .unwrap_or_default();
                map.insert("required".to_string(), Value::Array(required));
            }
            if let Some(Value::Object(props)) = map.get_mut("properties") {
                for (_k, v) in props.iter_mut() {
                    enforce_strict_schema(v);
                }
            }
            if let Some(items) = map.get_mut("items") {
                enforce_strict_schema(items);
            }
            for key in ["allOf", "anyOf", "oneOf"] {
                if let Some(Value::Array(variants)) = map.get_mut(key) {
                    for v in variants.iter_mut() {
                        enforce_strict_schema(v);
                    }
                }
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                enforce_strict_schema(v);
            }
        }
        _ => {}
    }
}

/// User message for one chunk: the instruction, the full KPI list and the rendered table.
pub fn build_user_prompt(chunk: &TableChunk, kpis: &[String]) -> String {
    format!(
        "{INSTRUCTION}\n\nCHUNK_ID: {}\n**KPI list**: {}\n**Table**:\n```markdown\n{}```\n",
        chunk.chunk_id,
        kpis.join(", "),
        render_chunk(chunk)
    )
}

/// Pulls the structured answer out of a Responses API payload.
pub fn extract_json_payload(val: &Value) -> Result<Value, ExtractError> {
    if let Some(items) = val.get("output").and_then(|o| o.as_array()) {
        for item in items {
            let Some(contents) = item.get("content").and_then(|c| c.as_array()) else {
                continue;
            };
            for c in contents {
                match c.get("type").and_then(|t| t.as_str()) {
                    Some("output_text") => {
                        let text = c.get("text").and_then(|t| t.as_str()).unwrap_or_default();
                        return parse_output_text(text);
                    }
                    Some("refusal") => {
                        let reason = c.get("refusal").and_then(|r| r.as_str()).unwrap_or("refused");
                        return Err(ExtractError::ContractNotInvoked(format!("refusal: {reason}")));
                    }
                    _ => {}
                }
            }
        }
    }

    // Some SDKs and proxies flatten the text to the top level.
    if let Some(text) = val.get("output_text").and_then(|t| t.as_str()) {
        return parse_output_text(text);
    }

    let status = val.get("status").and_then(|s| s.as_str()).unwrap_or("unknown");
    Err(ExtractError::ContractNotInvoked(format!(
        "no structured output in response (status {status})"
    )))
}

fn parse_output_text(text: &str) -> Result<Value, ExtractError> {
    if text.trim().is_empty() {
        return Err(ExtractError::ContractNotInvoked("empty output_text".to_string()));
    }
    serde_json::from_str(text).map_err(|e| ExtractError::Schema(format!("output_text is not JSON: {e}")))
}

/// Deserializes the model payload strictly and stamps provenance.
///
/// Accepts the schema object `{"kpis": [...]}` or a bare array of records.
/// Records naming a KPI outside `kpis` are dropped; records with a blank or
/// missing name are kept so structural validation can report them.
pub fn parse_records(payload: &Value, chunk: &TableChunk, kpis: &[String]) -> Result<Vec<CandidateRecord>, ExtractError> {
    let records: Vec<CandidateRecord> = if payload.is_array() {
        serde_json::from_value(payload.clone())
            .map_err(|e| ExtractError::Schema(format!("{}: {e}", chunk.chunk_id)))?
    } else {
        let parsed: ExtractionPayload = serde_json::from_value(payload.clone())
            .map_err(|e| ExtractError::Schema(format!("{}: {e}", chunk.chunk_id)))?;
        parsed.kpis
    };

    let wanted: HashSet<String> = kpis.iter().map(|k| k.trim().to_lowercase()).collect();
    let mut kept = Vec::with_capacity(records.len());
    for mut record in records {
        if let Some(name) = record.name.as_deref().filter(|n| !n.trim().is_empty()) {
            if !wanted.contains(&name.trim().to_lowercase()) {
                debug!("Dropping off-target record '{name}' from {}", chunk.chunk_id);
                continue;
            }
        }
        record.sheet = Some(chunk.sheet_id.clone());
        kept.push(record);
    }
    Ok(kept)
}

/// Extraction client backed by the OpenAI Responses API.
pub struct OpenAiExtractor {
    config: LlmConfig,
    client: Client,
    runtime: tokio::runtime::Runtime,
    schema: Value,
}

impl OpenAiExtractor {
    pub fn new(config: LlmConfig) -> Result<Self, ExtractError> {
        let client = Client::builder()
            .gzip(true)
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(config.timeout_seconds))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| ExtractError::Runtime(e.to_string()))?;
        let schema = payload_schema().map_err(|e| ExtractError::Schema(e.to_string()))?;
        Ok(Self {
            config,
            client,
            runtime,
            schema,
        })
    }

    fn request_body(&self, user_prompt: &str) -> Value {
        // Few-shot example to pin the coordinate convention
        let example_text = "**KPI list**: Revenue\n**Table**:\n```markdown\nSheet: P&L\n\
            | row | KPI (col 1) | 2023Q1 (col 2) |\n|---:|---|---|\n| 7 | Revenue | 1,200 |\n```";
        let example_output = json!({
            "kpis": [
                { "name": "Revenue", "value": "1,200", "header": "2023Q1", "row": 7, "column": 2 }
            ]
        })
        .to_string();

        json!({
            "model": self.config.model,
            "input": [
              {
                "role": "system",
                "content": [{ "type": "input_text", "text": SYSTEM_PROMPT }]
              },
              {
                "role": "user",
                "content": [{ "type": "input_text", "text": example_text }]
              },
              {
                "role": "assistant",
                "content": [{ "type": "output_text", "text": example_output }]
              },
              {
                "role": "user",
                "content": [{ "type": "input_text", "text": user_prompt }]
              }
            ],
            "text": {
              "format": {
                "type": "json_schema",
                "name": "extract_kpis",
                "schema": self.schema,
                "strict": true
              }
            }
        })
    }

    async fn call_structured(&self, body: &Value) -> Result<Value, ExtractError> {
        let url = format!("{}/responses", self.config.base_url.trim_end_matches('/'));
        let max_retries = self.config.max_retries.max(1);

        // Exponential backoff parameters
        let mut attempt = 0usize;
        let mut delay_ms = 750u64;

        loop {
            attempt += 1;
            let send_started = Instant::now();
            debug!("➡️ [OpenAI] Sending request (attempt {attempt})");
            let sent = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(body)
                .send()
                .await;

            let retry_reason = match sent {
                Ok(resp) => {
                    let status = resp.status();
                    let send_elapsed = send_started.elapsed();
                    if status.is_success() {
                        let val: Value = resp.json().await?;
                        debug!(
                            "✅ [OpenAI] Received structured JSON (network={}ms, tokens={})",
                            send_elapsed.as_millis(),
                            val.pointer("/usage/total_tokens").and_then(|t| t.as_u64()).unwrap_or(0)
                        );
                        return Ok(val);
                    }
                    let body = resp.text().await.unwrap_or_default();
                    if !is_retryable(status) || attempt >= max_retries {
                        error!("❌ [OpenAI] Giving up after {attempt} attempts: {status}");
                        return Err(ExtractError::Api {
                            status: status.as_u16(),
                            attempts: attempt,
                            body,
                        });
                    }
                    format!("status {status}: {body}")
                }
                Err(e) => {
                    if attempt >= max_retries {
                        error!("❌ [OpenAI] Exhausted retries: {e}");
                        return Err(ExtractError::Transport(e));
                    }
                    format!("transport error: {e}")
                }
            };

            warn!("⚠️ [OpenAI] Attempt {attempt} failed ({retry_reason}); retrying in {delay_ms}ms");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms as f64 * 1.75).min(5000.0) as u64;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT || status.is_server_error()
}

impl KpiExtractor for OpenAiExtractor {
    fn extract(&self, chunk: &TableChunk, kpis: &[String]) -> Result<Vec<CandidateRecord>, ExtractError> {
        let body = self.request_body(&build_user_prompt(chunk, kpis));
        let response = self.runtime.block_on(self.call_structured(&body))?;
        let payload = extract_json_payload(&response)?;
        let records = parse_records(&payload, chunk, kpis)?;
        info!("🧾 {}: {} candidate records", chunk.chunk_id, records.len());
        Ok(records)
    }
}
