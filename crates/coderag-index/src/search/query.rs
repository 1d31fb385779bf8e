//! Query intent detection and intent-based score boosting.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::SearchResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Definition,
    Usage,
    Implementation,
    Test,
    Example,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Function,
    Class,
    Variable,
    Import,
    Interface,
    Any,
}

impl EntityType {
    /// Chunk type label this entity corresponds to, if any.
    fn chunk_type(&self) -> Option<&'static str> {
        match self {
            EntityType::Function => Some("function"),
            EntityType::Class => Some("class"),
            EntityType::Variable => Some("variable"),
            EntityType::Import => Some("import"),
            EntityType::Interface => Some("interface"),
            EntityType::Any => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConstraints {
    pub path: Option<String>,
    pub name: Option<String>,
}

/// What a query appears to be looking for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryIntent {
    pub search_type: SearchType,
    pub entity_type: EntityType,
    pub keywords: Vec<String>,
    pub language: Option<String>,
    pub constraints: QueryConstraints,
    pub confidence: f32,
}

fn patterns(sources: &[&str]) -> Vec<Regex> {
    sources
        .iter()
        .map(|p| Regex::new(p).expect("valid intent regex"))
        .collect()
}

// Each list is in priority order: the first matching set names the intent.
static SEARCH_TYPE_PATTERNS: Lazy<Vec<(SearchType, Vec<Regex>)>> = Lazy::new(|| {
    vec![
        (
            SearchType::Test,
            patterns(&[
                r"(?i)(test|spec|mock|stub)\s+",
                r"(?i)test.*for\s+",
                r"(?i)(unit|integration|e2e)\s+test",
            ]),
        ),
        (
            SearchType::Usage,
            patterns(&[
                r"(?i)(where|how).*(used|called|invoked|referenced)",
                r"(?i)(usage|uses|calls|references)\s+of",
                r"(?i)who\s+(calls|uses|invokes)",
            ]),
        ),
        (
            SearchType::Definition,
            patterns(&[
                r"(?i)(define|definition|declaration)\s+",
                r"(?i)where\s+(is|are).*(defined|declared)",
                r"(?i)(func|function|class|struct|type|interface)\s+\w+",
            ]),
        ),
        (
            SearchType::Example,
            patterns(&[
                r"(?i)example\s+(of|for)",
                r"(?i)how\s+to\s+use",
                r"(?i)sample\s+code",
            ]),
        ),
        (
            SearchType::Implementation,
            patterns(&[
                r"(?i)(implement|create|write|build|make)\s+",
                r"(?i)how\s+to\s+(implement|create|write|build)",
                r"(?i)implementation\s+of",
            ]),
        ),
    ]
});

static ENTITY_TYPE_PATTERNS: Lazy<Vec<(EntityType, Vec<Regex>)>> = Lazy::new(|| {
    vec![
        (
            EntityType::Interface,
            patterns(&[r"(?i)interface\s+", r"(?i)implements\s+"]),
        ),
        (
            EntityType::Function,
            patterns(&[
                r"(?i)(func|function|method|procedure|routine)\s+",
                r"(?i)\w+\s*\([^)]*\)",
            ]),
        ),
        (
            EntityType::Class,
            patterns(&[r"(?i)(class|struct|type)\s+", r"(?i)new\s+\w+"]),
        ),
        (
            EntityType::Variable,
            patterns(&[
                r"(?i)(var|variable|const|constant|field|property)\s+",
                r"(?i)(get|set)\s+\w+",
            ]),
        ),
        (
            EntityType::Import,
            patterns(&[r"(?i)(import|require|include|use)\s+", r"(?i)dependency\s+"]),
        ),
    ]
});

static LANGUAGE_PATTERNS: Lazy<Vec<(&'static str, Vec<Regex>)>> = Lazy::new(|| {
    vec![
        (
            "go",
            patterns(&[
                r"(?i)\b(go|golang)\b",
                r"(?i)\b(goroutine|channel|defer)\b",
                r"(?i)\.go\b",
            ]),
        ),
        (
            "javascript",
            patterns(&[
                r"(?i)\b(js|javascript|node|nodejs)\b",
                r"(?i)\b(async|await|promise|callback)\b",
                r"(?i)\.(js|jsx|mjs)\b",
            ]),
        ),
        (
            "typescript",
            patterns(&[
                r"(?i)\b(ts|typescript)\b",
                r"(?i)\b(interface|type|enum)\b",
                r"(?i)\.(ts|tsx)\b",
            ]),
        ),
        (
            "python",
            patterns(&[
                r"(?i)\b(python|py)\b",
                r"(?i)\b(def|class|import from)\b",
                r"(?i)\.py\b",
            ]),
        ),
        (
            "react",
            patterns(&[
                r"(?i)\b(react|component|hooks?)\b",
                r"(?i)\b(useState|useEffect|props)\b",
                r"(?i)\.(jsx|tsx)\b",
            ]),
        ),
    ]
});

static PATH_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)in\s+(\S+\.go|\S+\.js|\S+\.py|\S+/\S+)").expect("valid path regex")
});

static NAME_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:func|function|class|struct|type)\s+(\w+)").expect("valid name regex")
});

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "been", "be", "have", "has", "had", "do", "does",
    "did", "will", "would", "could", "should", "may", "might", "can", "where", "how", "what",
    "which", "who",
];

/// Classify a query. Pure and cheap.
pub fn analyze_query(query: &str) -> QueryIntent {
    let mut intent = QueryIntent {
        search_type: SearchType::General,
        entity_type: EntityType::Any,
        keywords: extract_keywords(query),
        language: None,
        constraints: QueryConstraints::default(),
        confidence: 0.5,
    };

    for (search_type, set) in SEARCH_TYPE_PATTERNS.iter() {
        if set.iter().any(|p| p.is_match(query)) {
            if intent.search_type == SearchType::General {
                intent.search_type = *search_type;
            }
            intent.confidence += 0.1;
        }
    }

    for (entity_type, set) in ENTITY_TYPE_PATTERNS.iter() {
        if set.iter().any(|p| p.is_match(query)) {
            if intent.entity_type == EntityType::Any {
                intent.entity_type = *entity_type;
            }
            intent.confidence += 0.1;
        }
    }

    for (language, set) in LANGUAGE_PATTERNS.iter() {
        if set.iter().any(|p| p.is_match(query)) {
            if intent.language.is_none() {
                intent.language = Some(language.to_string());
            }
            intent.confidence += 0.05;
        }
    }

    if let Some(caps) = PATH_CONSTRAINT.captures(query) {
        intent.constraints.path = Some(caps[1].to_string());
        intent.confidence += 0.1;
    }

    if let Some(caps) = NAME_CONSTRAINT.captures(query) {
        intent.constraints.name = Some(caps[1].to_string());
        intent.confidence += 0.2;
    }

    intent.confidence = intent.confidence.min(1.0);
    intent
}

/// Lowercased query words without punctuation, stop words or single
/// letters (`c` and `r` are kept as language names).
pub fn extract_keywords(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .filter(|w| !w.is_empty() && !STOP_WORDS.contains(&w.as_str()))
        .filter(|w| w.chars().count() >= 2 || w == "c" || w == "r")
        .collect()
}

/// Multiply scores by intent boosts, then re-sort descending.
pub fn apply_intent(intent: &QueryIntent, mut results: Vec<SearchResult>) -> Vec<SearchResult> {
    for result in &mut results {
        let mut boost = 1.0f32;
        let path = result.file_path.to_lowercase();
        let kind = result.chunk_type.as_str();

        match intent.search_type {
            SearchType::Definition => {
                if matches!(kind, "function" | "class" | "type") {
                    boost *= 1.3;
                }
            }
            SearchType::Usage => {
                if !path.contains("test") && !path.contains("interface") {
                    boost *= 1.1;
                }
            }
            SearchType::Test => {
                if path.contains("test") || path.contains("spec") {
                    boost *= 1.5;
                }
            }
            SearchType::Implementation => {
                if matches!(kind, "function" | "method") {
                    boost *= 1.2;
                }
            }
            SearchType::Example | SearchType::General => {}
        }

        if intent.entity_type.chunk_type() == Some(kind) {
            boost *= 1.2;
        }

        if intent.language.as_deref() == Some(result.language.as_str()) {
            boost *= 1.15;
        }

        if let Some(ref name) = intent.constraints.name {
            if result.name.to_lowercase().contains(&name.to_lowercase()) {
                boost *= 2.0;
            }
        }

        if let Some(ref constraint) = intent.constraints.path {
            if result.file_path.contains(constraint.as_str()) {
                boost *= 1.5;
            }
        }

        result.score *= boost;
    }

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results
}
