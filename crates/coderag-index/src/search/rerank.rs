//! Heuristic reranking of fused results.
//!
//! Cheap signals that the embedding and BM25 scores miss: where the file
//! lives, whether the chunk is named after the query, and how large it is.

use super::SearchResult;

/// Path fragments and their weights. Only the first match applies.
const PATH_WEIGHTS: &[(&str, f32)] = &[
    ("handler", 1.5),
    ("controller", 1.5),
    ("route", 1.4),
    ("api", 1.4),
    ("service", 1.3),
    ("model", 1.2),
    ("schema", 1.2),
    ("repository", 1.1),
    ("util", 0.8),
    ("helper", 0.8),
    ("test", 0.7),
    ("spec", 0.7),
    ("mock", 0.6),
];

const TOKEN_MATCH_BOOST: f32 = 1.1;
const EXACT_NAME_BOOST: f32 = 5.0;
const PARTIAL_NAME_BOOST: f32 = 2.5;
const CONTEXT_BOOST: f32 = 1.2;
const TEST_CONTEXT_BOOST: f32 = 1.3;
const LANGUAGE_BOOST: f32 = 1.15;

const SHORT_CODE_CHARS: usize = 50;
const LONG_CODE_CHARS: usize = 2000;

/// Map a cosine similarity in `[-1, 1]` onto `(0, 1)` with a sigmoid so
/// semantic scores are comparable across queries.
pub fn normalize_score(score: f32) -> f32 {
    let scaled = (score + 1.0) / 2.0;
    1.0 / (1.0 + (-(scaled * 10.0 - 5.0)).exp())
}

/// Lower-cased runs of letters and digits.
fn query_tokens(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn path_weight(path: &str) -> f32 {
    PATH_WEIGHTS
        .iter()
        .find(|(pattern, _)| path.contains(pattern))
        .map(|(_, weight)| *weight)
        .unwrap_or(1.0)
}

fn heuristic_boost(result: &SearchResult, query_lower: &str, tokens: &[String], main_word: &str) -> f32 {
    let path = result.file_path.to_lowercase();
    let code = result.code.to_lowercase();
    let name = result.name.to_lowercase();
    let kind = result.chunk_type.as_str();

    let mut boost = path_weight(&path);

    for token in tokens {
        if code.contains(token.as_str()) {
            boost *= TOKEN_MATCH_BOOST;
        }
    }

    if !main_word.is_empty() && !name.is_empty() {
        if name == main_word {
            boost *= EXACT_NAME_BOOST;
        } else if name.contains(main_word) {
            boost *= PARTIAL_NAME_BOOST;
        }
    }

    if query_lower.contains("handler") && path.contains("handler") {
        boost *= CONTEXT_BOOST;
    }
    if query_lower.contains("service") && path.contains("service") {
        boost *= CONTEXT_BOOST;
    }
    if query_lower.contains("test") && path.contains("test") {
        boost *= TEST_CONTEXT_BOOST;
    }
    if query_lower.contains("function") && matches!(kind, "function" | "method") {
        boost *= CONTEXT_BOOST;
    }
    if query_lower.contains("class") && matches!(kind, "class" | "type") {
        boost *= CONTEXT_BOOST;
    }

    if tokens.iter().any(|t| t == "go") && result.language == "go" {
        boost *= LANGUAGE_BOOST;
    }
    if query_lower.contains("react") {
        let tsx = path.ends_with(".jsx") || path.ends_with(".tsx");
        if tsx || matches!(result.language.as_str(), "jsx" | "tsx") {
            boost *= LANGUAGE_BOOST;
        }
    }

    let length = result.code.chars().count();
    if length < SHORT_CODE_CHARS {
        boost *= 0.8;
    } else if length > LONG_CODE_CHARS {
        boost *= 0.9;
    }

    boost
}

/// Multiply each score by its heuristic boost and re-sort. The sort is
/// stable, so equal scores keep their fused order.
pub fn heuristic_rerank(mut results: Vec<SearchResult>, query: &str) -> Vec<SearchResult> {
    let query_lower = query.to_lowercase();
    let tokens = query_tokens(query);
    let main_word = tokens
        .iter()
        .fold("", |longest, t| if t.len() > longest.len() { t.as_str() } else { longest })
        .to_string();

    for result in &mut results {
        result.score *= heuristic_boost(result, &query_lower, &tokens, &main_word);
    }

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(path: &str, name: &str, code: &str) -> SearchResult {
        SearchResult {
            id: path.to_string(),
            file_path: path.to_string(),
            code: code.to_string(),
            language: "go".to_string(),
            score: 1.0,
            line_start: 1,
            line_end: 10,
            repository: String::new(),
            chunk_type: "function".to_string(),
            name: name.to_string(),
        }
    }

    fn body(text: &str) -> String {
        format!("{}{}", text, " ".repeat(60))
    }

    #[test]
    fn test_normalize_score() {
        assert!((normalize_score(0.0) - 0.5).abs() < 1e-6);
        assert!(normalize_score(1.0) > 0.99);
        assert!(normalize_score(-1.0) < 0.01);
        assert!(normalize_score(0.8) > normalize_score(0.6));
    }

    #[test]
    fn test_path_weight_first_match_wins() {
        assert!((path_weight("api/handler_test.go") - 1.5).abs() < 1e-6);
        assert!((path_weight("internal/util/strings.go") - 0.8).abs() < 1e-6);
        assert!((path_weight("main.go") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_exact_name_beats_partial() {
        let results = vec![
            result("pkg/a.go", "parseConfigFile", &body("func parseConfigFile() {}")),
            result("pkg/b.go", "parseconfig", &body("func parseConfig() {}")),
        ];
        let ranked = heuristic_rerank(results, "parseconfig");
        assert_eq!(ranked[0].file_path, "pkg/b.go");
    }

    #[test]
    fn test_token_matches_boost() {
        let results = vec![
            result("pkg/a.go", "", &body("nothing relevant")),
            result("pkg/b.go", "", &body("open the database connection")),
        ];
        let ranked = heuristic_rerank(results, "database connection");
        assert_eq!(ranked[0].file_path, "pkg/b.go");
        assert!((ranked[0].score - 1.1 * 1.1).abs() < 1e-4);
    }

    #[test]
    fn test_length_penalties() {
        let short = heuristic_rerank(vec![result("a.go", "", "x")], "zzz");
        assert!((short[0].score - 0.8).abs() < 1e-6);

        let long = heuristic_rerank(vec![result("a.go", "", &"y".repeat(2100))], "zzz");
        assert!((long[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_handler_context_and_language() {
        let ranked = heuristic_rerank(
            vec![result("api/handlers/user.go", "", &body("code"))],
            "user handler in go",
        );
        // path 1.5, handler context 1.2, go language 1.15, "user" in code? no
        let expected = 1.5 * 1.2 * 1.15;
        assert!((ranked[0].score - expected).abs() < 1e-4);
    }

    #[test]
    fn test_empty_results() {
        assert!(heuristic_rerank(Vec::new(), "anything").is_empty());
    }
}
