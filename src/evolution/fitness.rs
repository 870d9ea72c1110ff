//! Fitness from live HTTP responses.
//!
//! Every evaluation issues at most one request. The score depends only on the
//! outcome class, the status code, the response body and the payload, so
//! [`FitnessEvaluator::score`] is a pure function that tests can drive without
//! a network.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::schema::{
    ContentHeuristic, Diagnostics, EvaluationConfig, FitnessConfig, ResponseClass,
};

use super::target::{HttpTarget, TargetResponse, TransportError};

/// Fitness plus the diagnostics that explain it.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub fitness: f32,
    pub diagnostics: Diagnostics,
}

/// Evaluates payloads against the target API.
pub struct FitnessEvaluator {
    config: FitnessConfig,
    eval_config: EvaluationConfig,
    target: Arc<dyn HttpTarget>,
    requests: AtomicU64,
}

impl FitnessEvaluator {
    /// Create a new fitness evaluator.
    pub fn new(
        config: FitnessConfig,
        eval_config: EvaluationConfig,
        target: Arc<dyn HttpTarget>,
    ) -> Self {
        Self {
            config,
            eval_config,
            target,
            requests: AtomicU64::new(0),
        }
    }

    /// Fitness parameters.
    pub fn config(&self) -> &FitnessConfig {
        &self.config
    }

    /// Requests issued so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Serialize, send once and score.
    pub fn evaluate(&self, payload: &Map<String, Value>) -> Evaluation {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Malformed candidate: {e}");
                return self.failure(ResponseClass::Malformed, format!("Serialization failed: {e}"), 0);
            }
        };
        if body.len() > self.eval_config.max_body_bytes {
            log::warn!(
                "Malformed candidate: body of {} bytes exceeds {} byte limit",
                body.len(),
                self.eval_config.max_body_bytes
            );
            return self.failure(
                ResponseClass::Malformed,
                format!(
                    "Body of {} bytes exceeds {} byte limit",
                    body.len(),
                    self.eval_config.max_body_bytes
                ),
                0,
            );
        }

        self.requests.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let evaluation = match self.target.send(&body) {
            Ok(response) => {
                let limit = Duration::from_millis(self.eval_config.timeout_ms);
                if response.elapsed > limit {
                    self.timeout(
                        format!(
                            "Response timed out ({} ms > {} ms limit)",
                            response.elapsed.as_millis(),
                            limit.as_millis()
                        ),
                        millis(response.elapsed),
                    )
                } else {
                    self.score(payload, &response)
                }
            }
            Err(e @ TransportError::Timeout(_)) => self.timeout(e.to_string(), millis(start.elapsed())),
            Err(e) => self.failure(ResponseClass::NetworkFailure, e.to_string(), millis(start.elapsed())),
        };

        log::debug!(
            "Evaluated payload: status={:?} fitness={:.3}",
            evaluation.diagnostics.status,
            evaluation.fitness
        );
        evaluation
    }

    /// Lowest-band evaluation for a call that produced no usable response.
    pub fn failure(&self, class: ResponseClass, reason: impl Into<String>, elapsed_ms: u64) -> Evaluation {
        Evaluation {
            fitness: self.config.bands.failure,
            diagnostics: Diagnostics::failure(class, reason, elapsed_ms),
        }
    }

    /// Lowest-band evaluation for a call that exceeded the timeout.
    pub fn timeout(&self, reason: impl Into<String>, elapsed_ms: u64) -> Evaluation {
        Evaluation {
            fitness: self.config.bands.failure,
            diagnostics: Diagnostics::timeout(reason, elapsed_ms),
        }
    }

    /// Score a response to `payload`.
    pub fn score(&self, payload: &Map<String, Value>, response: &TargetResponse) -> Evaluation {
        let bands = &self.config.bands;
        let class = ResponseClass::from_status(response.status);
        let elapsed_ms = millis(response.elapsed);
        let excerpt: String = response
            .body
            .chars()
            .take(self.eval_config.excerpt_chars)
            .collect();

        if class == ResponseClass::NetworkFailure {
            return Evaluation {
                fitness: bands.failure,
                diagnostics: Diagnostics {
                    class,
                    status: Some(response.status),
                    elapsed_ms,
                    excerpt: Some(excerpt),
                    failure: Some(format!("Unusable status code {}", response.status)),
                    timed_out: false,
                    matched: Vec::new(),
                },
            };
        }

        let (content, matched) = self.content_score(payload, response);

        let fitness = match class {
            ResponseClass::ServerError => bands.server_error,
            ResponseClass::ClientError => {
                let weight = self
                    .config
                    .status_weights
                    .get(&response.status)
                    .copied()
                    .unwrap_or(self.config.default_client_error_weight);
                bands.client_error.at(0.5 * weight + 0.5 * content)
            }
            ResponseClass::Success => bands.success.at(content),
            ResponseClass::Other => bands.other,
            ResponseClass::NetworkFailure | ResponseClass::Malformed => bands.failure,
        };

        Evaluation {
            fitness,
            diagnostics: Diagnostics {
                class,
                status: Some(response.status),
                elapsed_ms,
                excerpt: Some(excerpt),
                failure: None,
                timed_out: false,
                matched,
            },
        }
    }

    /// Sum of matched bonuses capped at 1, and the descriptions of the matches.
    fn content_score(&self, payload: &Map<String, Value>, response: &TargetResponse) -> (f32, Vec<String>) {
        let body_lower = response.body.to_lowercase();
        let body_json: Option<Value> = serde_json::from_str(&response.body).ok();

        let mut total = 0.0f32;
        let mut matched = Vec::new();

        for heuristic in &self.config.heuristics {
            let hit = match heuristic {
                ContentHeuristic::BodyContains { pattern, .. } => {
                    body_lower.contains(&pattern.to_lowercase())
                }
                ContentHeuristic::EchoedField { field, .. } => match (&body_json, payload.get(field)) {
                    (Some(json), Some(value)) => echoes(json, field, value),
                    _ => false,
                },
                ContentHeuristic::FieldEquals { field, value, .. } => payload.get(field) == Some(value),
                ContentHeuristic::DistinctItems {
                    field, min_distinct, ..
                } => payload
                    .get(field)
                    .and_then(Value::as_array)
                    .is_some_and(|items| {
                        items.iter().map(Value::to_string).collect::<HashSet<_>>().len() >= *min_distinct
                    }),
            };
            if hit {
                total += heuristic.bonus();
                matched.push(describe(heuristic));
            }
        }

        if let Some(slow) = &self.config.slow_response
            && millis(response.elapsed) >= slow.threshold_ms
        {
            total += slow.bonus;
            matched.push(format!("slow response (>= {} ms)", slow.threshold_ms));
        }

        (total.min(1.0), matched)
    }
}

/// Whether any object in `json` maps `field` to `value`.
fn echoes(json: &Value, field: &str, value: &Value) -> bool {
    match json {
        Value::Object(map) => {
            map.get(field) == Some(value) || map.values().any(|v| echoes(v, field, value))
        }
        Value::Array(items) => items.iter().any(|v| echoes(v, field, value)),
        _ => false,
    }
}

fn describe(heuristic: &ContentHeuristic) -> String {
    match heuristic {
        ContentHeuristic::BodyContains { pattern, .. } => format!("body contains `{pattern}`"),
        ContentHeuristic::EchoedField { field, .. } => format!("response echoes `{field}`"),
        ContentHeuristic::FieldEquals { field, value, .. } => format!("`{field}` == {value}"),
        ContentHeuristic::DistinctItems {
            field, min_distinct, ..
        } => format!("`{field}` has >= {min_distinct} distinct items"),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
