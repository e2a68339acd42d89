//! In-memory flat vector index
//!
//! Brute-force cosine similarity over every stored chunk. Document sets are a
//! handful of PDFs, so a linear scan per query is enough.

use std::cmp::Ordering;

/// A retrieved chunk and its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit<'a> {
    pub text: &'a str,
    pub score: f32,
}

#[derive(Debug, Default)]
pub struct VectorIndex {
    entries: Vec<Entry>,
}

#[derive(Debug)]
struct Entry {
    text: String,
    vector: Vec<f32>,
    norm: f32,
}

impl VectorIndex {
    /// Pair each chunk with its embedding. Extra items on either side are
    /// ignored; callers pass vectors straight from the embedding call, which
    /// returns one per input.
    pub fn from_embeddings(chunks: Vec<String>, vectors: Vec<Vec<f32>>) -> Self {
        let entries = chunks
            .into_iter()
            .zip(vectors)
            .map(|(text, vector)| Entry {
                norm: norm(&vector),
                text,
                vector,
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top `k` chunks by cosine similarity, best first. Equal scores keep
    /// insertion order. Zero-length vectors score 0.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<Hit<'_>> {
        let query_norm = norm(query);
        let mut hits: Vec<Hit<'_>> = self
            .entries
            .iter()
            .map(|entry| Hit {
                text: &entry.text,
                score: cosine(query, query_norm, &entry.vector, entry.norm),
            })
            .collect();
        // Stable sort, so ties stay in insertion order.
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(k);
        hits
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}
