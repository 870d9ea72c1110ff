//! Discovery driver: runs the engine and ranks what it found.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::evolution::{
    EvolutionEngine, EvolutionError, Grammar, HttpTarget, PayloadArchive, ReqwestTarget,
    TransportError,
};
use crate::schema::{
    CandidateSnapshot, ConfigError, Diagnostics, EvolutionProgress, EvolutionStats,
    GenerationStats, RunConfig,
};

/// Errors surfaced by a discovery run.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Evolution(#[from] EvolutionError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("HTTP client setup failed: {0}")]
    Client(#[from] TransportError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One entry of the ranked result list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPayload {
    /// 1-based rank, fittest first.
    pub rank: usize,
    pub payload: Map<String, Value>,
    pub fitness: f32,
    pub diagnostics: Option<Diagnostics>,
    /// Generation the payload first appeared in.
    pub generation: usize,
    pub tags: Vec<String>,
}

/// Outcome of a discovery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// Top-K distinct payloads, fittest first.
    pub top: Vec<DiscoveredPayload>,
    /// Best individual of the whole run.
    pub best: CandidateSnapshot,
    /// Statistics of every generation, generation 0 first.
    pub history: Vec<GenerationStats>,
    pub stats: EvolutionStats,
}

impl DiscoveryReport {
    /// Write `report.json`, `stats/generation_NNN.json` and
    /// `payloads/top_K.json` below `dir`. Returns the report path.
    pub fn write_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf, DiscoveryError> {
        let dir = dir.as_ref();
        let stats_dir = dir.join("stats");
        let payloads_dir = dir.join("payloads");
        fs::create_dir_all(&stats_dir)?;
        fs::create_dir_all(&payloads_dir)?;

        for stats in &self.history {
            let path = stats_dir.join(format!("generation_{:03}.json", stats.generation));
            fs::write(path, serde_json::to_string_pretty(stats)?)?;
        }

        for entry in &self.top {
            let path = payloads_dir.join(format!("top_{}.json", entry.rank));
            fs::write(path, serde_json::to_string_pretty(entry)?)?;
        }

        let report_path = dir.join("report.json");
        fs::write(&report_path, serde_json::to_string_pretty(self)?)?;
        Ok(report_path)
    }
}

/// Runs one discovery and assembles the ranked report.
pub struct DiscoveryDriver {
    engine: EvolutionEngine,
    top_k: usize,
}

impl DiscoveryDriver {
    /// Validate the configuration and prepare a run against `target`.
    /// Nothing is sent to the target until [`run`](Self::run).
    pub fn new(config: RunConfig, target: Arc<dyn HttpTarget>) -> Result<Self, DiscoveryError> {
        let top_k = config.archive.top_k;
        let engine = EvolutionEngine::new(config, target)?;
        Ok(Self { engine, top_k })
    }

    /// Validate, then build the `reqwest` target (logging in when configured).
    pub fn from_config(config: RunConfig) -> Result<Self, DiscoveryError> {
        config.validate()?;
        Grammar::new(config.grammar.clone()).map_err(ConfigError::from)?;

        let target = ReqwestTarget::from_config(&config.evaluation)?;
        Self::new(config, Arc::new(target))
    }

    /// Get cancellation handle. The report of a cancelled run still holds the
    /// best payload found so far.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.engine.cancel_handle()
    }

    /// Underlying engine.
    pub fn engine(&self) -> &EvolutionEngine {
        &self.engine
    }

    /// Run discovery with progress callback.
    pub fn run_with_callback<F>(&mut self, callback: F) -> Result<DiscoveryReport, DiscoveryError>
    where
        F: FnMut(&EvolutionProgress),
    {
        let result = self.engine.run_with_callback(callback)?;

        let top = self
            .engine
            .archive()
            .top_n(self.top_k)
            .into_iter()
            .enumerate()
            .map(|(i, entry)| DiscoveredPayload {
                rank: i + 1,
                payload: entry.snapshot.payload.clone(),
                fitness: entry.snapshot.fitness,
                diagnostics: entry.snapshot.diagnostics.clone(),
                generation: entry.snapshot.generation,
                tags: entry.tags.clone(),
            })
            .collect();

        Ok(DiscoveryReport {
            top,
            best: result.best,
            history: result.history,
            stats: result.stats,
        })
    }

    /// Run discovery (blocking).
    pub fn run(&mut self) -> Result<DiscoveryReport, DiscoveryError> {
        self.run_with_callback(|_| {})
    }

    /// Save every archived payload of the last run as a JSON file in `dir`.
    pub fn export_archive<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<PathBuf>, DiscoveryError> {
        let source = self.engine.archive();
        let mut export = PayloadArchive::new(source.len().max(1)).with_output_dir(dir)?;
        for entry in source.all() {
            export.add(entry.snapshot.clone(), entry.tags.clone());
        }
        Ok(export.save_all()?)
    }
}
