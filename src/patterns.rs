//! PatternRAG: a small in-process TF-IDF memory of reusable snippets (§4.13).
//!
//! Persisted the same way as `LearningEngine` — temp-file-plus-rename JSON —
//! via [`crate::persist`].

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PatternStoreConfig;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "her", "was", "one", "our",
    "out", "day", "get", "has", "him", "his", "how", "man", "new", "now", "old", "see", "two",
    "way", "who", "boy", "did", "its", "let", "put", "say", "she", "too", "use", "with", "that",
    "this", "from", "have", "will", "your",
];

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2 && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn term_frequencies(tokens: &[String]) -> HashMap<String, f64> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for token in tokens {
        *counts.entry(token.clone()).or_insert(0) += 1;
    }
    let total = tokens.len().max(1) as f64;
    counts.into_iter().map(|(term, count)| (term, count as f64 / total)).collect()
}

/// A stored snippet plus its TF vector and access bookkeeping (§3 `PatternRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    pub id: String,
    pub content: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub tf_vector: HashMap<String, f64>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub relevance: f64,
}

/// A read-only search hit (§4.13 `search`).
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: usize,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub min_similarity: Option<f64>,
}

/// The durable snapshot written to `patterns.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternSnapshot {
    records: Vec<PatternRecord>,
}

pub struct PatternStore {
    records: HashMap<String, PatternRecord>,
    /// Document-frequency table: term → number of records containing it.
    /// Invalidated (recomputed lazily) on every add/update/delete, per §4.13.
    doc_freq: HashMap<String, u32>,
    config: PatternStoreConfig,
}

impl PatternStore {
    pub fn new(config: PatternStoreConfig) -> Self {
        Self {
            records: HashMap::new(),
            doc_freq: HashMap::new(),
            config,
        }
    }

    pub fn from_snapshot(snapshot: PatternSnapshot, config: PatternStoreConfig) -> Self {
        let mut store = Self::new(config);
        for record in snapshot.records {
            store.doc_freq_add(&record.tf_vector);
            store.records.insert(record.id.clone(), record);
        }
        store
    }

    pub fn to_snapshot(&self) -> PatternSnapshot {
        PatternSnapshot {
            records: self.records.values().cloned().collect(),
        }
    }

    fn doc_freq_add(&mut self, tf_vector: &HashMap<String, f64>) {
        for term in tf_vector.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
    }

    fn doc_freq_remove(&mut self, tf_vector: &HashMap<String, f64>) {
        for term in tf_vector.keys() {
            if let Some(count) = self.doc_freq.get_mut(term) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.doc_freq.remove(term);
                }
            }
        }
    }

    /// `add(pattern) → id` (§4.13). Tokenizes `description + content`,
    /// updates the document-frequency table, and evicts the lowest-ranked
    /// record if capacity is exceeded.
    pub fn add(&mut self, content: String, description: String, category: String, tags: Vec<String>) -> String {
        let tokens = tokenize(&format!("{description} {content}"));
        let tf_vector = term_frequencies(&tokens);
        self.doc_freq_add(&tf_vector);

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let record = PatternRecord {
            id: id.clone(),
            content,
            description,
            category,
            tags,
            tf_vector,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            relevance: 1.0,
        };
        self.records.insert(id.clone(), record);

        if self.records.len() > self.config.max_patterns {
            self.evict_one();
        }
        id
    }

    fn evict_one(&mut self) {
        let worst = self
            .records
            .values()
            .min_by(|a, b| {
                eviction_score(a)
                    .partial_cmp(&eviction_score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|r| r.id.clone());
        if let Some(id) = worst {
            if let Some(record) = self.records.remove(&id) {
                self.doc_freq_remove(&record.tf_vector);
            }
        }
    }

    pub fn delete(&mut self, id: &str) -> bool {
        if let Some(record) = self.records.remove(id) {
            self.doc_freq_remove(&record.tf_vector);
            true
        } else {
            false
        }
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.records.len().max(1) as f64;
        let df = *self.doc_freq.get(term).unwrap_or(&0) as f64;
        (n / (1.0 + df)).ln().max(0.0)
    }

    /// `search(query, opts) → [{..., similarity}]` (§4.13). Ranks by cosine
    /// similarity of TF-IDF vectors times current relevance, filtered by
    /// category/tags/min_similarity.
    pub fn search(&mut self, query: &str, opts: &SearchOptions) -> Vec<SearchHit> {
        let query_tf = term_frequencies(&tokenize(query));
        let query_tfidf: HashMap<&str, f64> = query_tf
            .iter()
            .map(|(term, tf)| (term.as_str(), tf * self.idf(term)))
            .collect();
        let query_norm = l2_norm(query_tfidf.values().copied());

        let min_similarity = opts.min_similarity.unwrap_or(self.config.min_similarity);
        let limit = if opts.limit == 0 { 10 } else { opts.limit };

        let mut scored: Vec<(String, f64)> = self
            .records
            .values()
            .filter(|r| opts.category.as_deref().map(|c| c == r.category).unwrap_or(true))
            .filter(|r| opts.tags.is_empty() || opts.tags.iter().any(|t| r.tags.contains(t)))
            .map(|record| {
                let doc_tfidf: HashMap<&str, f64> = record
                    .tf_vector
                    .iter()
                    .map(|(term, tf)| (term.as_str(), tf * self.idf(term)))
                    .collect();
                let dot: f64 = query_tfidf
                    .iter()
                    .filter_map(|(term, q)| doc_tfidf.get(term).map(|d| q * d))
                    .sum();
                let doc_norm = l2_norm(doc_tfidf.values().copied());
                let cosine = if query_norm > 0.0 && doc_norm > 0.0 {
                    dot / (query_norm * doc_norm)
                } else {
                    0.0
                };
                (record.id.clone(), cosine * record.relevance)
            })
            .filter(|(_, score)| *score >= min_similarity)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let now = Utc::now();
        scored
            .into_iter()
            .filter_map(|(id, similarity)| {
                let record = self.records.get_mut(&id)?;
                record.access_count += 1;
                record.last_accessed = now;
                Some(SearchHit {
                    id: record.id.clone(),
                    content: record.content.clone(),
                    description: record.description.clone(),
                    category: record.category.clone(),
                    tags: record.tags.clone(),
                    similarity,
                })
            })
            .collect()
    }

    /// `applyDecay()` (§4.13): `relevance = decay_factor^age_days` (age since
    /// last access), and drops records older than `max_age_days` since
    /// creation.
    pub fn apply_decay(&mut self) {
        let now = Utc::now();
        let max_age = self.config.max_age_days;
        let decay_factor = self.config.decay_factor;

        let expired: Vec<String> = self
            .records
            .values()
            .filter(|r| (now - r.created_at).num_seconds() as f64 / 86_400.0 > max_age)
            .map(|r| r.id.clone())
            .collect();
        for id in expired {
            self.delete(&id);
        }

        for record in self.records.values_mut() {
            let age_days = (now - record.last_accessed).num_seconds() as f64 / 86_400.0;
            record.relevance = decay_factor.powf(age_days.max(0.0));
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn l2_norm(values: impl Iterator<Item = f64>) -> f64 {
    values.map(|v| v * v).sum::<f64>().sqrt()
}

fn eviction_score(record: &PatternRecord) -> f64 {
    record.relevance * ((record.access_count as f64 + 1.0).ln())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PatternStoreConfig {
        PatternStoreConfig {
            max_patterns: 3,
            max_age_days: 90.0,
            decay_factor: 0.98,
            min_similarity: 0.0,
        }
    }

    #[test]
    fn tokenize_drops_stop_words_and_short_tokens() {
        let tokens = tokenize("The cat sat on a mat with us");
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"on".to_string()));
        assert!(tokens.contains(&"cat".to_string()));
    }

    #[test]
    fn search_ranks_more_similar_pattern_higher() {
        let mut store = PatternStore::new(config());
        store.add(
            "fn retry_with_backoff() { loop { sleep(); } }".into(),
            "exponential backoff retry helper".into(),
            "resilience".into(),
            vec!["retry".into()],
        );
        store.add(
            "fn parse_csv(path: &str) -> Vec<Row>".into(),
            "csv parsing utility".into(),
            "parsing".into(),
            vec!["csv".into()],
        );

        let hits = store.search(
            "need a retry backoff helper",
            &SearchOptions {
                limit: 5,
                category: None,
                tags: vec![],
                min_similarity: Some(0.0),
            },
        );
        assert!(!hits.is_empty());
        assert!(hits[0].description.contains("backoff"));
    }

    #[test]
    fn category_filter_excludes_non_matching_records() {
        let mut store = PatternStore::new(config());
        store.add("a".into(), "alpha pattern".into(), "cat-a".into(), vec![]);
        store.add("b".into(), "beta pattern".into(), "cat-b".into(), vec![]);

        let hits = store.search(
            "pattern",
            &SearchOptions {
                limit: 10,
                category: Some("cat-a".into()),
                tags: vec![],
                min_similarity: Some(0.0),
            },
        );
        assert!(hits.iter().all(|h| h.category == "cat-a"));
    }

    #[test]
    fn eviction_removes_lowest_scoring_record_over_capacity() {
        let mut store = PatternStore::new(config());
        let id_a = store.add("x".into(), "first pattern".into(), "c".into(), vec![]);
        store.add("y".into(), "second pattern".into(), "c".into(), vec![]);
        store.add("z".into(), "third pattern".into(), "c".into(), vec![]);
        assert_eq!(store.len(), 3);

        // force id_a to have the lowest eviction score
        if let Some(r) = store.records.get_mut(&id_a) {
            r.relevance = 0.01;
        }
        store.add("w".into(), "fourth pattern".into(), "c".into(), vec![]);
        assert_eq!(store.len(), 3);
        assert!(!store.records.contains_key(&id_a));
    }

    #[test]
    fn decay_reduces_relevance_and_expires_old_records() {
        let mut store = PatternStore::new(config());
        let id = store.add("x".into(), "something".into(), "c".into(), vec![]);
        if let Some(r) = store.records.get_mut(&id) {
            r.last_accessed = Utc::now() - chrono::Duration::days(10);
        }
        store.apply_decay();
        let relevance = store.records.get(&id).unwrap().relevance;
        assert!(relevance < 1.0);
    }
}
