//! BM25 scoring over a single text field.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::tokens::code_tokens;

/// BM25 parameters
const K1: f64 = 1.2; // Term frequency saturation
const B: f64 = 0.75; // Length normalization

/// Term frequencies of one indexed document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    term_freqs: HashMap<String, usize>,
    length: usize,
}

/// BM25 index for one field of the keyword documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BM25Index {
    documents: HashMap<String, Document>,
    /// Number of documents containing each term
    doc_freqs: HashMap<String, usize>,
    total_length: usize,
}

impl BM25Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens kept for scoring: identifier-aware, at least two characters.
    pub fn tokenize(text: &str) -> Vec<String> {
        code_tokens(text)
            .into_iter()
            .filter(|t| t.chars().count() > 1)
            .collect()
    }

    /// Add or replace a document.
    pub fn add_document(&mut self, id: &str, text: &str) {
        self.remove_document(id);

        let tokens = Self::tokenize(text);
        let mut term_freqs: HashMap<String, usize> = HashMap::new();
        for token in &tokens {
            *term_freqs.entry(token.clone()).or_insert(0) += 1;
        }
        for term in term_freqs.keys() {
            *self.doc_freqs.entry(term.clone()).or_insert(0) += 1;
        }

        self.total_length += tokens.len();
        self.documents.insert(
            id.to_string(),
            Document {
                term_freqs,
                length: tokens.len(),
            },
        );
    }

    pub fn remove_document(&mut self, id: &str) -> bool {
        let Some(doc) = self.documents.remove(id) else {
            return false;
        };

        self.total_length = self.total_length.saturating_sub(doc.length);
        for term in doc.term_freqs.keys() {
            if let Some(count) = self.doc_freqs.get_mut(term) {
                *count -= 1;
                if *count == 0 {
                    self.doc_freqs.remove(term);
                }
            }
        }
        true
    }

    fn avg_doc_length(&self) -> f64 {
        if self.documents.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.documents.len() as f64
        }
    }

    fn idf(&self, term: &str) -> f64 {
        let doc_freq = self.doc_freqs.get(term).copied().unwrap_or(0) as f64;
        if doc_freq == 0.0 {
            return 0.0;
        }

        let n = self.documents.len() as f64;
        ((n - doc_freq + 0.5) / (doc_freq + 0.5) + 1.0).ln()
    }

    /// BM25 score of one document for already tokenized query terms.
    pub fn score(&self, doc_id: &str, query_terms: &[String]) -> f64 {
        let Some(doc) = self.documents.get(doc_id) else {
            return 0.0;
        };

        let avg = self.avg_doc_length().max(1.0);
        let doc_length = doc.length as f64;
        let mut seen = HashSet::new();
        let mut score = 0.0;

        for term in query_terms {
            if !seen.insert(term.as_str()) {
                continue;
            }
            let tf = doc.term_freqs.get(term).copied().unwrap_or(0) as f64;
            if tf > 0.0 {
                let numerator = tf * (K1 + 1.0);
                let denominator = tf + K1 * (1.0 - B + B * (doc_length / avg));
                score += self.idf(term) * (numerator / denominator);
            }
        }

        score
    }

    /// Ranked `(id, score)` pairs with a positive score.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f64)> {
        let query_terms = Self::tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let mut scores: Vec<(String, f64)> = self
            .documents
            .keys()
            .map(|id| (id.clone(), self.score(id, &query_terms)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scores.truncate(limit);
        scores
    }

    /// Every distinct indexed term.
    pub fn vocabulary(&self) -> impl Iterator<Item = &str> {
        self.doc_freqs.keys().map(String::as_str)
    }

    pub fn contains_term(&self, term: &str) -> bool {
        self.doc_freqs.contains_key(term)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn clear(&mut self) {
        self.documents.clear();
        self.doc_freqs.clear();
        self.total_length = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        let tokens = BM25Index::tokenize("Hello, World! This is a test_function.");
        assert!(tokens.contains(&"hello".to_string()));
        assert!(tokens.contains(&"world".to_string()));
        assert!(tokens.contains(&"test_function".to_string()));
        assert!(tokens.contains(&"function".to_string()));
        assert!(!tokens.contains(&"a".to_string()));
    }

    #[test]
    fn test_add_and_search() {
        let mut index = BM25Index::new();
        index.add_document("1", "The quick brown fox");
        index.add_document("2", "The lazy dog");
        index.add_document("3", "The quick rabbit");

        let results = index.search("quick fox", 10);
        assert!(!results.is_empty());
        assert_eq!(results[0].0, "1");
    }

    #[test]
    fn test_camel_case_matches_part() {
        let mut index = BM25Index::new();
        index.add_document("1", "func getUserName() string");
        index.add_document("2", "func renderPage() string");

        let results = index.search("user", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "1");
    }

    #[test]
    fn test_readd_replaces_document() {
        let mut index = BM25Index::new();
        index.add_document("1", "alpha beta");
        index.add_document("1", "gamma delta");

        assert_eq!(index.len(), 1);
        assert!(index.search("alpha", 10).is_empty());
        assert_eq!(index.search("gamma", 10)[0].0, "1");
        assert!(!index.contains_term("alpha"));
    }

    #[test]
    fn test_remove_document() {
        let mut index = BM25Index::new();
        index.add_document("1", "Test document");
        assert_eq!(index.len(), 1);

        assert!(index.remove_document("1"));
        assert!(!index.remove_document("1"));
        assert!(index.is_empty());
        assert_eq!(index.vocabulary().count(), 0);
    }

    #[test]
    fn test_empty_query() {
        let mut index = BM25Index::new();
        index.add_document("1", "Test document");
        assert!(index.search("", 10).is_empty());
        assert!(index.search("!!", 10).is_empty());
    }

    #[test]
    fn test_limit_and_deterministic_order() {
        let mut index = BM25Index::new();
        for i in 0..5 {
            index.add_document(&i.to_string(), "same text");
        }
        let results = index.search("same", 3);
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_clear() {
        let mut index = BM25Index::new();
        index.add_document("1", "Test");
        index.add_document("2", "Another test");
        index.clear();
        assert!(index.is_empty());
        assert!(index.search("test", 10).is_empty());
    }
}
