// src/overseer/knowledge.rs
// Read-only retrieval over a directory of operational documents. The
// Overseer consults it for remediation context and for "we have failed this
// way before" incident matches; ingestion is somebody else's job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Fraction of fingerprint tokens an incident passage must cover before the
/// match is confident enough to deny on.
const INCIDENT_COVERAGE: f32 = 0.75;

#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub doc: String,
    pub text: String,
    pub score: f32,
}

struct Passage {
    doc: String,
    doc_tokens: Vec<String>,
    text: String,
    tokens: HashMap<String, usize>,
    length: usize,
}

pub struct KnowledgeIndex {
    passages: Vec<Passage>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

impl KnowledgeIndex {
    pub fn empty() -> Self {
        KnowledgeIndex { passages: Vec::new() }
    }

    /// Index every .md/.txt under `path`, split into paragraph passages.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::empty();
        };
        if !path.exists() {
            warn!(path = %path.display(), "knowledge index path does not exist; queries will return nothing");
            return Self::empty();
        }
        let mut passages = Vec::new();
        let mut stack = vec![path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let entry_path = entry.path();
                if entry_path.is_dir() {
                    stack.push(entry_path);
                    continue;
                }
                let is_doc = entry_path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e == "md" || e == "txt")
                    .unwrap_or(false);
                if !is_doc {
                    continue;
                }
                if let Ok(raw) = std::fs::read_to_string(&entry_path) {
                    index_document(&mut passages, path, &entry_path, &raw);
                }
            }
        }
        info!(passages = passages.len(), path = %path.display(), "knowledge index loaded");
        KnowledgeIndex { passages }
    }

    /// Ranked passages for a free-text query. Term-frequency scoring with a
    /// boost for hits in the document name, normalized by passage length.
    pub fn query(&self, text: &str, k: usize) -> Vec<ScoredPassage> {
        let query_tokens = tokenize(text);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<ScoredPassage> = self
            .passages
            .iter()
            .filter_map(|passage| {
                let mut score = 0.0f32;
                for token in &query_tokens {
                    if let Some(count) = passage.tokens.get(token) {
                        score += *count as f32;
                    }
                    if passage.doc_tokens.iter().any(|t| t == token) {
                        score += 2.0;
                    }
                }
                if score == 0.0 {
                    return None;
                }
                score /= (passage.length as f32).sqrt().max(1.0);
                Some(ScoredPassage {
                    doc: passage.doc.clone(),
                    text: passage.text.clone(),
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// A confident prior-incident match for a request fingerprint: the
    /// passage must come from an incident document, record a failed outcome,
    /// and cover nearly every fingerprint token (so a single generic word
    /// like "lab" can never trigger a denial).
    pub fn find_incident(&self, fingerprint: &str) -> Option<ScoredPassage> {
        let tokens: Vec<String> = {
            let mut t = tokenize(fingerprint);
            t.sort();
            t.dedup();
            t
        };
        if tokens.is_empty() {
            return None;
        }
        for passage in &self.passages {
            if !passage.doc.contains("incident") {
                continue;
            }
            if !passage.text.to_lowercase().contains("outcome: failed") {
                continue;
            }
            let present = tokens
                .iter()
                .filter(|t| passage.tokens.contains_key(*t) || passage.doc_tokens.contains(*t))
                .count();
            let coverage = present as f32 / tokens.len() as f32;
            if coverage >= INCIDENT_COVERAGE {
                debug!(doc = %passage.doc, coverage = f64::from(coverage), "prior incident matched");
                return Some(ScoredPassage {
                    doc: passage.doc.clone(),
                    text: passage.text.clone(),
                    score: coverage,
                });
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

fn index_document(passages: &mut Vec<Passage>, root: &Path, path: &PathBuf, raw: &str) {
    let doc = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned();
    let doc_tokens = tokenize(&doc);
    for paragraph in raw.split("\n\n") {
        let text = paragraph.trim();
        if text.is_empty() {
            continue;
        }
        let tokens_vec = tokenize(text);
        let length = tokens_vec.len();
        let mut tokens = HashMap::new();
        for token in tokens_vec {
            *tokens.entry(token).or_insert(0) += 1;
        }
        passages.push(Passage {
            doc: doc.clone(),
            doc_tokens: doc_tokens.clone(),
            text: text.to_string(),
            tokens,
            length,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn index_with(files: &[(&str, &str)]) -> KnowledgeIndex {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }
        KnowledgeIndex::load(Some(dir.path()))
    }

    #[test]
    fn missing_path_yields_an_empty_index() {
        let index = KnowledgeIndex::load(Some(Path::new("/nonexistent/kb")));
        assert!(index.is_empty());
        assert!(index.query("anything", 3).is_empty());
    }

    #[test]
    fn queries_rank_relevant_passages_first() {
        let index = index_with(&[
            (
                "runbooks/guest-agent.md",
                "Guest agent missing\n\nWhen a vm is running but reports no ip, install qemu-guest-agent inside the guest and restart it.\n\nUnrelated paragraph about backups.",
            ),
            ("runbooks/dns.md", "DNS troubleshooting\n\nCheck resolv.conf."),
        ]);
        let hits = index.query("vm running no ip guest agent", 2);
        assert!(!hits.is_empty());
        assert!(hits[0].text.contains("qemu-guest-agent"));
    }

    #[test]
    fn incident_match_requires_confidence_and_failed_outcome() {
        let index = index_with(&[
            (
                "incidents/2026-03-destroy-lab.md",
                "destroy_lab lab:prod-range outcome: failed\n\ndestroy_lab against lab:prod-range failed twice; platform wedged mid-teardown. outcome: failed",
            ),
            ("runbooks/misc.md", "destroy procedures are documented elsewhere."),
        ]);
        assert!(index.find_incident("destroy_lab lab:prod-range").is_some());
        // A fingerprint matching no incident doc stays clean.
        assert!(index.find_incident("deploy_lab lab:fresh").is_none());
    }
}
