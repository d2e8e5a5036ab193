// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Lightweight hybrid retrieval over previously stored snippets.
//!
//! Two signals, blended: an inverted word index (exact lexical overlap) and
//! a low-dimensional deterministic hash embedding (fuzzy overlap without any
//! model dependency).  Everything lives in memory; persistence and
//! embedding quality are out of scope.

use std::collections::{HashMap, HashSet};

/// A stored snippet: prior solution, error pattern, code fragment.
#[derive(Debug, Clone)]
pub struct MemoryDocument {
    pub id: usize,
    pub text: String,
}

const EMBEDDING_DIM: usize = 64;

pub struct MemoryIndex {
    docs: Vec<MemoryDocument>,
    embeddings: Vec<[f32; EMBEDDING_DIM]>,
    inverted: HashMap<String, Vec<usize>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            docs: Vec::new(),
            embeddings: Vec::new(),
            inverted: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Store a snippet and return its id.
    pub fn insert(&mut self, text: impl Into<String>) -> usize {
        let text = text.into();
        let id = self.docs.len();
        for word in tokenize(&text) {
            let postings = self.inverted.entry(word).or_default();
            if postings.last() != Some(&id) {
                postings.push(id);
            }
        }
        self.embeddings.push(embed(&text));
        self.docs.push(MemoryDocument { id, text });
        id
    }

    /// Top-k documents for a query with blended scores in [0, 1].
    pub fn search(&self, query: &str, k: usize) -> Vec<(&MemoryDocument, f32)> {
        if self.docs.is_empty() || k == 0 {
            return vec![];
        }
        let query_words: HashSet<String> = tokenize(query).into_iter().collect();
        if query_words.is_empty() {
            return vec![];
        }
        let query_embedding = embed(query);

        let mut scored: Vec<(usize, f32)> = self
            .docs
            .iter()
            .map(|doc| {
                let lexical = self.lexical_overlap(&query_words, doc.id);
                let semantic = cosine(&query_embedding, &self.embeddings[doc.id]);
                (doc.id, 0.5 * lexical + 0.5 * semantic)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(k)
            .filter(|(_, score)| *score > 0.0)
            .map(|(id, score)| (&self.docs[id], score))
            .collect()
    }

    /// Fraction of query words present in the document.
    fn lexical_overlap(&self, query_words: &HashSet<String>, doc_id: usize) -> f32 {
        let hits = query_words
            .iter()
            .filter(|w| {
                self.inverted
                    .get(*w)
                    .is_some_and(|postings| postings.binary_search(&doc_id).is_ok())
            })
            .count();
        hits as f32 / query_words.len() as f32
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() > 1)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Deterministic hash embedding: each word lands in a bucket (FNV-1a), the
/// vector is L2-normalized.  Not semantically meaningful, but stable and
/// dependency-free, enough for near-duplicate retrieval.
fn embed(text: &str) -> [f32; EMBEDDING_DIM] {
    let mut v = [0f32; EMBEDDING_DIM];
    for word in tokenize(text) {
        v[fnv1a(&word) as usize % EMBEDDING_DIM] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn cosine(a: &[f32; EMBEDDING_DIM], b: &[f32; EMBEDDING_DIM]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f32>().max(0.0)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
