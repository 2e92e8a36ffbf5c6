//! Oracle backed by an OpenAI-compatible HTTP endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tracing::{debug, warn};

use super::{
    lexical, AttackAssessment, GenerateOptions, Oracle, OracleError, OracleResult, TextStream,
};
use crate::config::OracleConfig;

/// One parsed server-sent-events line.
#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    Delta(String),
    Done,
    Skip,
}

pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    serde_json::from_str::<serde_json::Value>(data)
        .ok()
        .and_then(|v| {
            v["choices"][0]["delta"]["content"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(|s| SseLine::Delta(s.to_string()))
        })
        .unwrap_or(SseLine::Skip)
}

fn first_number(text: &str) -> Option<f64> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|s| s.trim_matches('.'))
        .filter(|s| !s.is_empty())
        .find_map(|s| s.parse::<f64>().ok())
}

fn affirmative(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("true") || lower.trim_start().starts_with("yes")
}

/// Model-backed oracle with an embedding cache.
pub struct LiveOracle {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    embedding_model: String,
    max_tokens: u32,
    embeddings: Mutex<HashMap<String, Vec<f32>>>,
}

impl LiveOracle {
    pub fn new(config: &OracleConfig) -> OracleResult<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| OracleError::NotConfigured("base_url".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OracleError::RequestFailed(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            max_tokens: config.max_tokens,
            embeddings: Mutex::new(HashMap::new()),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn embed(&self, text: &str) -> OracleResult<Vec<f32>> {
        if let Some(hit) = self.embeddings.lock().ok().and_then(|c| c.get(text).cloned()) {
            return Ok(hit);
        }

        let response = self
            .post("/v1/embeddings")
            .json(&serde_json::json!({ "model": self.embedding_model, "input": text }))
            .send()
            .await
            .map_err(|e| OracleError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::RequestFailed(format!(
                "embedding API error ({status}): {body}"
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OracleError::ParseError(e.to_string()))?;
        let vector: Vec<f32> = body["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| OracleError::ParseError("missing data[0].embedding".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if let Ok(mut cache) = self.embeddings.lock() {
            cache.insert(text.to_string(), vector.clone());
        }
        Ok(vector)
    }

    /// Short deterministic judgement prompt.
    async fn judge(&self, prompt: &str) -> OracleResult<String> {
        let opts = GenerateOptions::default()
            .with_temperature(0.0)
            .with_system("Answer tersely. Reply with the requested value only.");
        self.generate_once(prompt, &opts).await
    }
}

#[async_trait]
impl Oracle for LiveOracle {
    fn name(&self) -> &str {
        &self.model
    }

    fn is_live(&self) -> bool {
        true
    }

    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> OracleResult<TextStream> {
        let mut messages = Vec::new();
        if let Some(system) = &opts.system_prompt {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": prompt }));

        let response = self
            .post("/v1/chat/completions")
            .json(&serde_json::json!({
                "model": self.model,
                "messages": messages,
                "temperature": opts.temperature,
                "max_tokens": opts.max_tokens.min(self.max_tokens),
                "stream": true,
            }))
            .send()
            .await
            .map_err(|e| OracleError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::RequestFailed(format!(
                "completion API error ({status}): {body}"
            )));
        }

        debug!(model = %self.model, "Completion stream opened");

        let bytes = Box::pin(response.bytes_stream());
        let state = (bytes, Vec::<u8>::new(), VecDeque::<OracleResult<String>>::new(), false);
        let chunks = stream::unfold(state, |(mut bytes, mut buf, mut pending, mut done)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (bytes, buf, pending, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buf.drain(..=pos).collect();
                            match parse_sse_line(String::from_utf8_lossy(&line).trim()) {
                                SseLine::Delta(text) => pending.push_back(Ok(text)),
                                SseLine::Done => {
                                    done = true;
                                    break;
                                }
                                SseLine::Skip => {}
                            }
                        }
                    }
                    Some(Err(e)) => {
                        done = true;
                        pending.push_back(Err(OracleError::Stream(e.to_string())));
                    }
                    None => done = true,
                }
            }
        });

        Ok(Box::pin(chunks))
    }

    async fn similarity(&self, a: &str, b: &str) -> f64 {
        if a.trim().is_empty() || b.trim().is_empty() {
            return 0.0;
        }
        match (self.embed(a).await, self.embed(b).await) {
            (Ok(ea), Ok(eb)) => lexical::cosine(&ea, &eb).clamp(0.0, 1.0),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Embedding failed, using lexical similarity");
                lexical::jaccard(a, b)
            }
        }
    }

    async fn entailment(&self, premise: &str, hypothesis: &str) -> f64 {
        let prompt = format!(
            "Premise: {premise}\nHypothesis: {hypothesis}\n\
             How strongly does the premise entail the hypothesis? Reply with a number from 0 to 1."
        );
        match self.judge(&prompt).await {
            Ok(answer) => first_number(&answer)
                .map(|v| v.clamp(0.0, 1.0))
                .unwrap_or_else(|| lexical::jaccard(premise, hypothesis)),
            Err(e) => {
                warn!(error = %e, "Entailment check failed, using lexical overlap");
                lexical::jaccard(premise, hypothesis)
            }
        }
    }

    async fn contradicts(&self, a: &str, b: &str) -> bool {
        let prompt = format!(
            "Claim A: {a}\nClaim B: {b}\nDo these claims contradict each other? Reply true or false."
        );
        match self.judge(&prompt).await {
            Ok(answer) => affirmative(&answer),
            Err(e) => {
                warn!(error = %e, "Contradiction check failed, using heuristic");
                lexical::contradiction(a, b)
            }
        }
    }

    async fn violates(&self, claim: &str, constraint: &str) -> bool {
        let prompt = format!(
            "Constraint: {constraint}\nClaim: {claim}\nDoes the claim violate the constraint? Reply true or false."
        );
        match self.judge(&prompt).await {
            Ok(answer) => affirmative(&answer),
            Err(e) => {
                warn!(error = %e, "Constraint check failed, using keyword rules");
                lexical::violation(claim, constraint)
            }
        }
    }

    async fn assess_attack(&self, attacker: &str, target: &str, reasoning: &str) -> AttackAssessment {
        let prompt = format!(
            "Attacker: {attacker}\nTarget: {target}\nReasoning: {reasoning}\n\
             Is this a valid attack on the target? Reply true or false, then one sentence."
        );
        match self.judge(&prompt).await {
            Ok(answer) => {
                let is_valid = affirmative(&answer);
                AttackAssessment {
                    is_valid,
                    confidence: if is_valid { 0.7 } else { 0.5 },
                    explanation: answer.chars().take(200).collect(),
                }
            }
            Err(e) => {
                warn!(error = %e, "Attack check failed, using heuristic");
                let is_valid = lexical::attack_is_reasoned(reasoning);
                AttackAssessment {
                    is_valid,
                    confidence: if is_valid { 0.6 } else { 0.4 },
                    explanation: "Heuristic validation".to_string(),
                }
            }
        }
    }
}
