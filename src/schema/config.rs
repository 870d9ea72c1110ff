//! Configuration types for the target API and the fitness function.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How candidates are delivered to the target API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Endpoint receiving the JSON payloads (POST).
    #[serde(default = "default_target_url")]
    pub target_url: String,
    /// Upper bound on a single HTTP call, connect included.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum number of concurrent HTTP calls within a generation.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Optional bearer-token login performed once before the run.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Serialized payloads larger than this are rejected as malformed.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Characters of the response body kept in diagnostics.
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            target_url: default_target_url(),
            timeout_ms: default_timeout_ms(),
            concurrency: default_concurrency(),
            headers: BTreeMap::new(),
            auth: None,
            max_body_bytes: default_max_body_bytes(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

fn default_target_url() -> String {
    "http://localhost:5000/api/users".to_string()
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_concurrency() -> usize {
    4
}
fn default_max_body_bytes() -> usize {
    64 * 1024
}
fn default_excerpt_chars() -> usize {
    256
}

/// Bearer-token login performed before evolution starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Login endpoint (POST).
    pub token_url: String,
    /// JSON body sent to the login endpoint.
    pub credentials: Value,
    /// Field of the login response holding the token.
    #[serde(default = "default_token_field")]
    pub token_field: String,
}

fn default_token_field() -> String {
    "access_token".to_string()
}

/// Fitness function parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessConfig {
    /// Fitness bands per response class.
    #[serde(default)]
    pub bands: FitnessBands,
    /// Relative interest of specific 4xx status codes (0.0-1.0).
    #[serde(default = "default_status_weights")]
    pub status_weights: BTreeMap<u16, f32>,
    /// Weight for 4xx codes missing from `status_weights`.
    #[serde(default = "default_client_error_weight")]
    pub default_client_error_weight: f32,
    /// Content heuristics contributing bonuses within a band.
    #[serde(default = "default_heuristics")]
    pub heuristics: Vec<ContentHeuristic>,
    /// Bonus for slow (but not timed out) responses.
    #[serde(default = "default_slow_response")]
    pub slow_response: Option<SlowResponseRule>,
    /// Fitness at or above which a payload is tagged `high-fitness`.
    #[serde(default = "default_high_fitness_threshold")]
    pub high_fitness_threshold: f32,
}

impl Default for FitnessConfig {
    fn default() -> Self {
        Self {
            bands: FitnessBands::default(),
            status_weights: default_status_weights(),
            default_client_error_weight: default_client_error_weight(),
            heuristics: default_heuristics(),
            slow_response: default_slow_response(),
            high_fitness_threshold: default_high_fitness_threshold(),
        }
    }
}

fn default_status_weights() -> BTreeMap<u16, f32> {
    BTreeMap::from([
        (400, 0.5),
        (401, 0.6),
        (403, 0.7),
        (404, 0.3),
        (409, 0.6),
        (422, 0.5),
        (429, 0.7),
    ])
}
fn default_client_error_weight() -> f32 {
    0.4
}
fn default_heuristics() -> Vec<ContentHeuristic> {
    let contains = |pattern: &str, bonus: f32| ContentHeuristic::BodyContains {
        pattern: pattern.to_string(),
        bonus,
    };
    vec![
        contains("sql", 0.5),
        contains("database", 0.5),
        contains("syntax error", 0.4),
        contains("injection", 0.6),
        contains("memory", 0.4),
        contains("resource exhausted", 0.4),
        contains("overflow", 0.3),
        contains("timeout", 0.2),
        contains("invalid token", 0.3),
        contains("validation", 0.2),
    ]
}
fn default_slow_response() -> Option<SlowResponseRule> {
    Some(SlowResponseRule::default())
}
fn default_high_fitness_threshold() -> f32 {
    0.6
}

/// Fitness bands. Network failures sit strictly below every other class and
/// server errors strictly above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessBands {
    /// Network failure, timeout or malformed candidate.
    #[serde(default = "default_failure_band")]
    pub failure: f32,
    /// 2xx responses, placed by content score.
    #[serde(default = "default_success_band")]
    pub success: BandRange,
    /// 1xx and 3xx responses.
    #[serde(default = "default_other_band")]
    pub other: f32,
    /// 4xx responses, placed by status weight and content score.
    #[serde(default = "default_client_error_band")]
    pub client_error: BandRange,
    /// 5xx responses.
    #[serde(default = "default_server_error_band")]
    pub server_error: f32,
}

impl Default for FitnessBands {
    fn default() -> Self {
        Self {
            failure: default_failure_band(),
            success: default_success_band(),
            other: default_other_band(),
            client_error: default_client_error_band(),
            server_error: default_server_error_band(),
        }
    }
}

fn default_failure_band() -> f32 {
    0.0
}
fn default_success_band() -> BandRange {
    BandRange { min: 0.05, max: 0.45 }
}
fn default_other_band() -> f32 {
    0.2
}
fn default_client_error_band() -> BandRange {
    BandRange { min: 0.3, max: 0.6 }
}
fn default_server_error_band() -> f32 {
    1.0
}

/// Closed fitness interval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BandRange {
    pub min: f32,
    pub max: f32,
}

impl BandRange {
    /// Map a position in `[0, 1]` into the band.
    pub fn at(&self, position: f32) -> f32 {
        self.min + (self.max - self.min) * position.clamp(0.0, 1.0)
    }
}

/// Bonus rules applied to a response (and the payload that produced it).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentHeuristic {
    /// Response body contains `pattern` (case-insensitive).
    BodyContains { pattern: String, bonus: f32 },
    /// Response JSON echoes the payload's value for `field`.
    EchoedField { field: String, bonus: f32 },
    /// Payload field equals a designated value.
    FieldEquals {
        field: String,
        value: Value,
        bonus: f32,
    },
    /// Payload array field holds at least `min_distinct` distinct items.
    DistinctItems {
        field: String,
        min_distinct: usize,
        bonus: f32,
    },
}

impl ContentHeuristic {
    pub fn bonus(&self) -> f32 {
        match self {
            Self::BodyContains { bonus, .. }
            | Self::EchoedField { bonus, .. }
            | Self::FieldEquals { bonus, .. }
            | Self::DistinctItems { bonus, .. } => *bonus,
        }
    }
}

/// Bonus for responses slower than a threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowResponseRule {
    pub threshold_ms: u64,
    pub bonus: f32,
}

impl Default for SlowResponseRule {
    fn default() -> Self {
        Self {
            threshold_ms: 1_000,
            bonus: 0.2,
        }
    }
}

impl EvaluationConfig {
    /// Validate target settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_url.trim().is_empty() {
            return Err(ConfigError::MissingTarget);
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::InvalidBodyLimit);
        }
        Ok(())
    }
}

impl FitnessConfig {
    /// Validate band ordering and bonus signs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.bands;
        let values = [
            b.failure,
            b.success.min,
            b.success.max,
            b.other,
            b.client_error.min,
            b.client_error.max,
            b.server_error,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::InvalidBands("bands must be finite".to_string()));
        }
        for (name, range) in [("success", b.success), ("client_error", b.client_error)] {
            if range.min > range.max {
                return Err(ConfigError::InvalidBands(format!(
                    "{name} band min ({}) > max ({})",
                    range.min, range.max
                )));
            }
        }
        let middle = [b.success.min, b.other, b.client_error.min];
        if middle.iter().any(|&v| v <= b.failure) {
            return Err(ConfigError::InvalidBands(
                "failure band must be strictly below every other band".to_string(),
            ));
        }
        let upper = [b.success.max, b.other, b.client_error.max];
        if upper.iter().any(|&v| v >= b.server_error) {
            return Err(ConfigError::InvalidBands(
                "server error band must be strictly above every other band".to_string(),
            ));
        }

        for (&status, &weight) in &self.status_weights {
            if !(400..500).contains(&status) {
                return Err(ConfigError::InvalidWeight(format!(
                    "status weight for {status} (only 4xx codes are weighted)"
                )));
            }
            if !(0.0..=1.0).contains(&weight) {
                return Err(ConfigError::InvalidWeight(format!(
                    "status {status} weight {weight} outside [0, 1]"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.default_client_error_weight) {
            return Err(ConfigError::InvalidWeight(format!(
                "default client error weight {} outside [0, 1]",
                self.default_client_error_weight
            )));
        }

        for heuristic in &self.heuristics {
            let bonus = heuristic.bonus();
            if !bonus.is_finite() || bonus < 0.0 {
                return Err(ConfigError::InvalidWeight(format!(
                    "heuristic bonus {bonus} must be non-negative"
                )));
            }
        }
        if let Some(slow) = &self.slow_response
            && (!slow.bonus.is_finite() || slow.bonus < 0.0)
        {
            return Err(ConfigError::InvalidWeight(format!(
                "slow response bonus {} must be non-negative",
                slow.bonus
            )));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Population size must be positive")]
    InvalidPopulationSize,
    #[error("Number of generations must be positive")]
    InvalidGenerations,
    #[error("{name} probability {value} must lie in [0, 1]")]
    InvalidProbability { name: &'static str, value: f32 },
    #[error("Tournament size must be positive")]
    InvalidTournamentSize,
    #[error("Rank selection pressure {0} must lie in [1, 2)")]
    InvalidRankPressure(f32),
    #[error("Mutation must touch at least one field")]
    InvalidMutationFields,
    #[error("Target URL is empty")]
    MissingTarget,
    #[error("HTTP timeout must be positive")]
    InvalidTimeout,
    #[error("Concurrency limit must be positive")]
    InvalidConcurrency,
    #[error("Body size limit must be positive")]
    InvalidBodyLimit,
    #[error("Invalid fitness bands: {0}")]
    InvalidBands(String),
    #[error("Invalid weight: {0}")]
    InvalidWeight(String),
    #[error("Archive size and top-k must be positive")]
    InvalidArchive,
    #[error("Invalid grammar: {0}")]
    Grammar(#[from] super::GrammarError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_valid() {
        assert!(EvaluationConfig::default().validate().is_ok());
        assert!(FitnessConfig::default().validate().is_ok());
    }

    #[test]
    fn test_band_ordering_enforced() {
        let mut config = FitnessConfig::default();
        config.bands.server_error = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBands(_))));

        let mut config = FitnessConfig::default();
        config.bands.failure = 0.25;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBands(_))));
    }

    #[test]
    fn test_negative_bonus_rejected() {
        let mut config = FitnessConfig::default();
        config.heuristics.push(ContentHeuristic::BodyContains {
            pattern: "x".to_string(),
            bonus: -0.1,
        });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidWeight(_))));
    }

    #[test]
    fn test_band_range_at() {
        let band = BandRange { min: 0.2, max: 0.6 };
        assert_eq!(band.at(0.0), 0.2);
        assert!((band.at(0.5) - 0.4).abs() < 1e-6);
        assert_eq!(band.at(3.0), 0.6);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = EvaluationConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidTimeout));
    }
}
