//! Payload archive for storing and exporting discovered payloads.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schema::{CandidateSnapshot, Diagnostics, FitnessConfig, ResponseClass};

/// Archive of distinct interesting payloads.
#[derive(Debug, Default)]
pub struct PayloadArchive {
    /// Stored payloads indexed by individual ID.
    payloads: HashMap<u64, ArchivedPayload>,
    /// Output directory for saving payloads.
    output_dir: Option<PathBuf>,
    /// Maximum archive size.
    max_size: usize,
    /// Payloads closer than this to an archived one compete with it.
    diversity_threshold: f32,
}

/// An archived payload with metadata.
#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    /// The candidate snapshot.
    pub snapshot: CandidateSnapshot,
    /// Tags for categorization.
    pub tags: Vec<String>,
    /// File path if saved.
    pub saved_path: Option<PathBuf>,
}

impl PayloadArchive {
    /// Create a new archive.
    pub fn new(max_size: usize) -> Self {
        Self {
            payloads: HashMap::new(),
            output_dir: None,
            max_size,
            diversity_threshold: 0.0,
        }
    }

    /// Treat payloads within `threshold` (fraction of differing fields) as the
    /// same discovery, keeping only the fitter.
    pub fn with_diversity_threshold(mut self, threshold: f32) -> Self {
        self.diversity_threshold = threshold;
        self
    }

    /// Set output directory for saving payloads.
    pub fn with_output_dir<P: AsRef<Path>>(mut self, dir: P) -> io::Result<Self> {
        let path = dir.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        self.output_dir = Some(path);
        Ok(self)
    }

    /// Add a payload. Returns the ID when it was stored.
    pub fn add(&mut self, snapshot: CandidateSnapshot, tags: Vec<String>) -> Option<u64> {
        if self.max_size == 0 || self.payloads.contains_key(&snapshot.id) {
            return None;
        }

        // Nearest archived payload inside the similarity neighbourhood.
        let rival = self
            .payloads
            .values()
            .map(|p| (p.snapshot.id, payload_distance(&p.snapshot.payload, &snapshot.payload)))
            .filter(|&(_, d)| d == 0.0 || d < self.diversity_threshold)
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        if let Some((id, _)) = rival {
            if snapshot.fitness <= self.payloads[&id].snapshot.fitness {
                return None;
            }
            self.payloads.remove(&id);
        }

        if self.payloads.len() >= self.max_size
            && let Some(id) = self.weakest()
        {
            if snapshot.fitness <= self.payloads[&id].snapshot.fitness {
                return None;
            }
            self.payloads.remove(&id);
        }

        let id = snapshot.id;
        self.payloads.insert(
            id,
            ArchivedPayload {
                snapshot,
                tags,
                saved_path: None,
            },
        );
        Some(id)
    }

    fn weakest(&self) -> Option<u64> {
        self.payloads
            .values()
            .min_by(|a, b| {
                a.snapshot
                    .fitness
                    .total_cmp(&b.snapshot.fitness)
                    .then(b.snapshot.id.cmp(&a.snapshot.id))
            })
            .map(|p| p.snapshot.id)
    }

    /// Get a payload by ID.
    pub fn get(&self, id: u64) -> Option<&ArchivedPayload> {
        self.payloads.get(&id)
    }

    /// Get all payloads.
    pub fn all(&self) -> impl Iterator<Item = &ArchivedPayload> {
        self.payloads.values()
    }

    /// Get payloads by tag.
    pub fn by_tag(&self, tag: &str) -> impl Iterator<Item = &ArchivedPayload> {
        self.payloads
            .values()
            .filter(move |p| p.tags.iter().any(|t| t == tag))
    }

    /// Top N payloads by fitness; ties go to the earlier discovery.
    pub fn top_n(&self, n: usize) -> Vec<&ArchivedPayload> {
        let mut payloads: Vec<_> = self.payloads.values().collect();
        payloads.sort_by(|a, b| {
            b.snapshot
                .fitness
                .total_cmp(&a.snapshot.fitness)
                .then(a.snapshot.id.cmp(&b.snapshot.id))
        });
        payloads.into_iter().take(n).collect()
    }

    /// Save a payload to disk.
    pub fn save_payload(&mut self, id: u64) -> io::Result<PathBuf> {
        let output_dir = self
            .output_dir
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "No output directory set"))?;

        let entry = self
            .payloads
            .get_mut(&id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Payload not found"))?;

        let filename = format!(
            "payload_{}_gen{}_fit{:.3}.json",
            id, entry.snapshot.generation, entry.snapshot.fitness
        );
        let path = output_dir.join(&filename);

        let export = PayloadExport {
            payload: entry.snapshot.payload.clone(),
            metadata: PayloadMetadata {
                id,
                fitness: entry.snapshot.fitness,
                generation: entry.snapshot.generation,
                parents: entry.snapshot.parents.clone(),
                tags: entry.tags.clone(),
                diagnostics: entry.snapshot.diagnostics.clone(),
            },
        };

        let json = serde_json::to_string_pretty(&export)?;
        fs::write(&path, json)?;

        entry.saved_path = Some(path.clone());
        Ok(path)
    }

    /// Save all payloads to disk.
    pub fn save_all(&mut self) -> io::Result<Vec<PathBuf>> {
        let mut ids: Vec<u64> = self.payloads.keys().copied().collect();
        ids.sort_unstable();

        let mut paths = Vec::with_capacity(ids.len());
        for id in ids {
            paths.push(self.save_payload(id)?);
        }
        Ok(paths)
    }

    /// Load payloads from a directory. Files that do not parse are skipped.
    pub fn load_from_dir<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref();
        let mut archive = Self::new(usize::MAX);
        archive.output_dir = Some(dir.to_path_buf());

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();

            if path.extension().is_some_and(|e| e == "json")
                && let Ok(export) = load_payload_export(&path)
            {
                let snapshot = CandidateSnapshot {
                    id: export.metadata.id,
                    fitness: export.metadata.fitness,
                    payload: export.payload,
                    diagnostics: export.metadata.diagnostics,
                    generation: export.metadata.generation,
                    parents: export.metadata.parents,
                };

                archive.payloads.insert(
                    snapshot.id,
                    ArchivedPayload {
                        snapshot,
                        tags: export.metadata.tags,
                        saved_path: Some(path),
                    },
                );
            }
        }

        Ok(archive)
    }

    /// Get archive size.
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Check if archive is empty.
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Clear the archive.
    pub fn clear(&mut self) {
        self.payloads.clear();
    }
}

/// Exported payload format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadExport {
    /// JSON body that was sent.
    pub payload: Map<String, Value>,
    /// Payload metadata.
    pub metadata: PayloadMetadata,
}

/// Payload metadata for export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub id: u64,
    pub fitness: f32,
    pub generation: usize,
    #[serde(default)]
    pub parents: Vec<u64>,
    pub tags: Vec<String>,
    pub diagnostics: Option<Diagnostics>,
}

fn load_payload_export<P: AsRef<Path>>(path: P) -> io::Result<PayloadExport> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Fraction of keys (over both payloads) whose values differ.
fn payload_distance(a: &Map<String, Value>, b: &Map<String, Value>) -> f32 {
    let keys = a.len() + b.keys().filter(|k| !a.contains_key(*k)).count();
    if keys == 0 {
        return 0.0;
    }
    let same = a.iter().filter(|(k, v)| b.get(*k) == Some(*v)).count();
    (keys - same) as f32 / keys as f32
}

/// Auto-categorize a payload based on its diagnostics.
pub fn auto_categorize(snapshot: &CandidateSnapshot, fitness: &FitnessConfig) -> Vec<String> {
    let mut tags = Vec::new();

    if let Some(diagnostics) = &snapshot.diagnostics {
        match diagnostics.class {
            ResponseClass::ServerError => tags.push("server-error".to_string()),
            ResponseClass::ClientError => tags.push("client-error".to_string()),
            ResponseClass::Malformed => tags.push("malformed".to_string()),
            ResponseClass::NetworkFailure => {
                let tag = if diagnostics.timed_out { "timeout" } else { "network-failure" };
                tags.push(tag.to_string());
            }
            ResponseClass::Success | ResponseClass::Other => {}
        }

        if matches!(diagnostics.status, Some(401 | 403)) {
            tags.push("auth".to_string());
        }

        if let Some(slow) = &fitness.slow_response
            && diagnostics.status.is_some()
            && diagnostics.elapsed_ms >= slow.threshold_ms
        {
            tags.push("slow".to_string());
        }

        if let Some(excerpt) = &diagnostics.excerpt {
            let lower = excerpt.to_lowercase();
            if lower.contains("sql") || lower.contains("database") {
                tags.push("sql".to_string());
            }
            if lower.contains("memory") || lower.contains("resource exhausted") {
                tags.push("memory".to_string());
            }
        }
    }

    if snapshot.fitness >= fitness.high_fitness_threshold {
        tags.push("high-fitness".to_string());
    }

    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_snapshot(id: u64, fitness: f32) -> CandidateSnapshot {
        let mut payload = Map::new();
        payload.insert("id".into(), Value::from(id));
        payload.insert("name".into(), Value::from(format!("user{id}")));
        CandidateSnapshot {
            id,
            fitness,
            payload,
            diagnostics: None,
            generation: 0,
            parents: Vec::new(),
        }
    }

    fn with_diagnostics(mut snapshot: CandidateSnapshot, diagnostics: Diagnostics) -> CandidateSnapshot {
        snapshot.diagnostics = Some(diagnostics);
        snapshot
    }

    #[test]
    fn test_archive_add() {
        let mut archive = PayloadArchive::new(10);

        let id1 = archive.add(test_snapshot(1, 0.5), vec!["test".to_string()]);
        assert_eq!(id1, Some(1));

        let id2 = archive.add(test_snapshot(2, 0.7), vec![]);
        assert_eq!(id2, Some(2));

        assert_eq!(archive.add(test_snapshot(2, 0.9), vec![]), None);
        assert_eq!(archive.len(), 2);
    }

    #[test]
    fn test_archive_capacity() {
        let mut archive = PayloadArchive::new(2);

        archive.add(test_snapshot(1, 0.3), vec![]);
        archive.add(test_snapshot(2, 0.5), vec![]);

        // Adding higher fitness should evict lowest
        archive.add(test_snapshot(3, 0.7), vec![]);
        assert_eq!(archive.len(), 2);
        assert!(archive.get(1).is_none());
        assert!(archive.get(3).is_some());

        assert_eq!(archive.add(test_snapshot(4, 0.1), vec![]), None);
    }

    #[test]
    fn test_duplicate_payload_keeps_fitter() {
        let mut archive = PayloadArchive::new(10);
        let mut first = test_snapshot(1, 0.4);
        let mut second = test_snapshot(2, 0.9);
        second.payload = first.payload.clone();

        archive.add(first.clone(), vec![]);
        archive.add(second, vec![]);
        assert_eq!(archive.len(), 1);
        assert!(archive.get(2).is_some());

        first.id = 3;
        assert_eq!(archive.add(first, vec![]), None);
    }

    #[test]
    fn test_similarity_threshold() {
        let mut archive = PayloadArchive::new(10).with_diversity_threshold(0.6);
        let a = test_snapshot(1, 0.5);
        let mut b = test_snapshot(2, 0.8);
        // Same name, different id field: half the fields differ.
        b.payload.insert("name".into(), a.payload["name"].clone());

        archive.add(a, vec![]);
        archive.add(b, vec![]);
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.top_n(1)[0].snapshot.id, 2);
    }

    #[test]
    fn test_top_n() {
        let mut archive = PayloadArchive::new(10);

        archive.add(test_snapshot(1, 0.3), vec![]);
        archive.add(test_snapshot(2, 0.7), vec![]);
        archive.add(test_snapshot(3, 0.5), vec![]);

        let top2 = archive.top_n(2);
        assert_eq!(top2.len(), 2);
        assert_eq!(top2[0].snapshot.id, 2);
        assert_eq!(top2[1].snapshot.id, 3);
    }

    #[test]
    fn test_by_tag() {
        let mut archive = PayloadArchive::new(10);

        archive.add(test_snapshot(1, 0.5), vec!["server-error".to_string()]);
        archive.add(test_snapshot(2, 0.5), vec!["client-error".to_string()]);
        archive.add(test_snapshot(3, 0.5), vec!["server-error".to_string()]);

        let server_errors: Vec<_> = archive.by_tag("server-error").collect();
        assert_eq!(server_errors.len(), 2);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = PayloadArchive::new(10).with_output_dir(dir.path()).unwrap();
        archive.add(test_snapshot(1, 0.5), vec!["client-error".to_string()]);
        archive.add(test_snapshot(2, 1.0), vec!["server-error".to_string()]);

        let paths = archive.save_all().unwrap();
        assert_eq!(paths.len(), 2);
        assert!(archive.get(1).unwrap().saved_path.is_some());

        let loaded = PayloadArchive::load_from_dir(dir.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        let best = loaded.top_n(1)[0];
        assert_eq!(best.snapshot.id, 2);
        assert_eq!(best.tags, vec!["server-error".to_string()]);
        assert_eq!(best.snapshot.payload["name"], Value::from("user2"));
    }

    #[test]
    fn test_auto_categorize() {
        let config = FitnessConfig::default();

        let server = with_diagnostics(
            test_snapshot(1, 1.0),
            Diagnostics {
                class: ResponseClass::ServerError,
                status: Some(500),
                elapsed_ms: 1500,
                excerpt: Some("SQLite error: database is locked".to_string()),
                failure: None,
                timed_out: false,
                matched: Vec::new(),
            },
        );
        let tags = auto_categorize(&server, &config);
        for tag in ["server-error", "slow", "sql", "high-fitness"] {
            assert!(tags.contains(&tag.to_string()), "missing {tag}");
        }

        let unauthorized = with_diagnostics(
            test_snapshot(2, 0.4),
            Diagnostics {
                class: ResponseClass::ClientError,
                status: Some(401),
                elapsed_ms: 3,
                excerpt: None,
                failure: None,
                timed_out: false,
                matched: Vec::new(),
            },
        );
        assert_eq!(auto_categorize(&unauthorized, &config), vec!["client-error", "auth"]);

        let timeout = with_diagnostics(
            test_snapshot(3, 0.0),
            Diagnostics::timeout("no answer within limit", 10_000),
        );
        assert_eq!(auto_categorize(&timeout, &config), vec!["timeout"]);

        // Tags follow the flag, not the wording of the failure text.
        let refused = with_diagnostics(
            test_snapshot(4, 0.0),
            Diagnostics::failure(ResponseClass::NetworkFailure, "proxy said: timed out", 4),
        );
        assert_eq!(auto_categorize(&refused, &config), vec!["network-failure"]);
    }
}
