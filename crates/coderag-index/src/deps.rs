//! File-level dependency graph used to find what to re-index when a
//! file changes.
//!
//! Import and export statements are recognised with per-language regexes.
//! Resolution is approximate: relative imports are resolved against the
//! importing file, everything else is kept as the module path written in
//! the source.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::chunker::CodeChunker;

#[derive(Error, Debug)]
pub enum DepsError {
    #[error("Failed to persist dependency graph: {0}")]
    Persist(String),
}

static GO_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*import\s+(?:[\w.]+\s+)?["`]([^"`]+)["`]"#).expect("valid go import regex")
});
static GO_IMPORT_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*import\s*\(").expect("valid go import block regex"));
static GO_BLOCK_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["`]([^"`]+)["`]"#).expect("valid go block entry regex"));
static GO_EXPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:func|type)\s+([A-Z]\w*)").expect("valid go export regex")
});

static JS_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"import\s+.*?\s+from\s+['"]([^'"]+)['"]"#).expect("valid js import regex")
});
static JS_REQUIRE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).expect("valid require regex"));
static JS_EXPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"export\s+(?:default\s+)?(?:async\s+)?(?:function\*?|class|const|let|var)\s+(\w+)")
        .expect("valid js export regex")
});

static PY_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:from\s+(\S+)\s+)?import\s+(.+)$").expect("valid python import regex")
});
static PY_EXPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:async\s+)?(?:def|class)\s+([A-Za-z]\w*)").expect("valid python def regex"));

static JAVA_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*import\s+(?:static\s+)?([^;\s]+)\s*;").expect("valid java import regex")
});
static JAVA_EXPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"public\s+(?:(?:abstract|final|static)\s+)*(?:class|interface)\s+(\w+)")
        .expect("valid java export regex")
});

/// Import/export relationships between files.
///
/// `imported_by` is the exact transpose of `imports`, and `symbol_to_file`
/// the exact transpose of `exports`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    imports: HashMap<String, BTreeSet<String>>,
    imported_by: HashMap<String, BTreeSet<String>>,
    exports: HashMap<String, BTreeSet<String>>,
    symbol_to_file: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the edges of `path` with those found in `content`.
    pub fn analyze_file(&mut self, path: &str, content: &str) {
        self.remove_file(path);

        let language = CodeChunker::detect_language(Path::new(path)).unwrap_or("unknown");
        let (imports, exports) = match language {
            "go" => scan_go(content),
            "javascript" | "jsx" | "typescript" | "tsx" => scan_js(path, content),
            "python" => scan_python(content),
            "java" => scan_java(content),
            _ => return,
        };

        for import in imports {
            let target = resolve_relative(path, &import);
            self.add_import(path, target);
        }
        for symbol in exports {
            self.add_export(path, symbol);
        }
    }

    fn add_import(&mut self, importer: &str, imported: String) {
        if imported.is_empty() || imported == importer {
            return;
        }
        self.imported_by
            .entry(imported.clone())
            .or_default()
            .insert(importer.to_string());
        self.imports
            .entry(importer.to_string())
            .or_default()
            .insert(imported);
    }

    fn add_export(&mut self, file: &str, symbol: String) {
        self.symbol_to_file
            .entry(symbol.clone())
            .or_default()
            .insert(file.to_string());
        self.exports.entry(file.to_string()).or_default().insert(symbol);
    }

    /// Drop the outgoing edges and exports of `path` together with their
    /// reverse entries. Edges from other files into `path` are kept.
    pub fn remove_file(&mut self, path: &str) {
        if let Some(imports) = self.imports.remove(path) {
            for imported in imports {
                remove_from(&mut self.imported_by, &imported, path);
            }
        }
        if let Some(exports) = self.exports.remove(path) {
            for symbol in exports {
                remove_from(&mut self.symbol_to_file, &symbol, path);
            }
        }
    }

    /// Direct importers of `path`. When the file exports symbols, any file
    /// with an import mentioning the file's basename counts as well.
    pub fn dependents(&self, path: &str) -> Vec<String> {
        let mut dependents: BTreeSet<String> =
            self.imported_by.get(path).cloned().unwrap_or_default();

        if self.exports.get(path).is_some_and(|e| !e.is_empty()) {
            let base = basename(path);
            if !base.is_empty() {
                for (file, imports) in &self.imports {
                    if file != path && imports.iter().any(|i| i.contains(base)) {
                        dependents.insert(file.clone());
                    }
                }
            }
        }

        dependents.into_iter().collect()
    }

    /// Every file that reaches `path` through `imported_by`, excluding
    /// `path` itself. Sorted.
    pub fn transitive_dependents(&self, path: &str) -> Vec<String> {
        bfs(path, &self.imported_by)
    }

    /// What `path` imports, directly or transitively. Sorted.
    pub fn imports(&self, path: &str, transitive: bool) -> Vec<String> {
        if transitive {
            bfs(path, &self.imports)
        } else {
            self.imports
                .get(path)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        }
    }

    pub fn exports(&self, path: &str) -> Vec<String> {
        self.exports
            .get(path)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Files exporting `symbol`.
    pub fn files_exporting(&self, symbol: &str) -> Vec<String> {
        self.symbol_to_file
            .get(symbol)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of files with recorded imports or exports.
    pub fn len(&self) -> usize {
        self.imports
            .keys()
            .chain(self.exports.keys())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.imports.is_empty() && self.exports.is_empty()
    }

    pub fn clear(&mut self) {
        self.imports.clear();
        self.imported_by.clear();
        self.exports.clear();
        self.symbol_to_file.clear();
    }

    pub fn save(&self, path: &Path) -> Result<(), DepsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| DepsError::Persist(e.to_string()))?;
        }
        let json = serde_json::to_string(self).map_err(|e| DepsError::Persist(e.to_string()))?;
        fs::write(path, json).map_err(|e| DepsError::Persist(e.to_string()))?;
        debug!(path = %path.display(), files = self.len(), "Saved dependency graph");
        Ok(())
    }

    /// Load a saved graph. A missing file gives an empty graph.
    pub fn load(path: &Path) -> Result<Self, DepsError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let json = fs::read_to_string(path).map_err(|e| DepsError::Persist(e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| DepsError::Persist(e.to_string()))
    }
}

fn remove_from(map: &mut HashMap<String, BTreeSet<String>>, key: &str, value: &str) {
    if let Some(set) = map.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

fn bfs(start: &str, edges: &HashMap<String, BTreeSet<String>>) -> Vec<String> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    visited.insert(start);
    queue.push_back(start);

    while let Some(current) = queue.pop_front() {
        if let Some(next) = edges.get(current) {
            for n in next {
                if visited.insert(n.as_str()) {
                    queue.push_back(n.as_str());
                }
            }
        }
    }

    visited.remove(start);
    let mut out: Vec<String> = visited.into_iter().map(str::to_string).collect();
    out.sort();
    out
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
}

fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

/// Lexically normalise a `/`-separated path, folding `.` and `..`.
fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(p) if *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            p => parts.push(p),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

fn is_relative(import: &str) -> bool {
    import.starts_with("./") || import.starts_with("../")
}

fn resolve_relative(importer: &str, import: &str) -> String {
    if !is_relative(import) {
        return import.to_string();
    }
    let dir = dirname(importer);
    if dir.is_empty() {
        clean_path(import)
    } else {
        clean_path(&format!("{}/{}", dir, import))
    }
}

fn scan_go(content: &str) -> (Vec<String>, Vec<String>) {
    let mut imports = Vec::new();
    let mut exports = Vec::new();
    let mut in_block = false;

    for line in content.lines() {
        if in_block {
            let trimmed = line.trim();
            if trimmed.starts_with(')') {
                in_block = false;
                continue;
            }
            if trimmed.starts_with("//") {
                continue;
            }
            if let Some(caps) = GO_BLOCK_ENTRY.captures(trimmed) {
                imports.push(caps[1].to_string());
            }
            continue;
        }

        if GO_IMPORT_BLOCK.is_match(line) {
            in_block = true;
        } else if let Some(caps) = GO_IMPORT.captures(line) {
            imports.push(caps[1].to_string());
        } else if let Some(caps) = GO_EXPORT.captures(line) {
            exports.push(caps[1].to_string());
        }
    }

    imports.retain(|i| !i.contains("/vendor/"));
    (imports, exports)
}

fn scan_js(path: &str, content: &str) -> (Vec<String>, Vec<String>) {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("js");
    let mut imports = Vec::new();
    let mut exports = Vec::new();

    let with_extension = |import: &str| -> String {
        if is_relative(import) && Path::new(basename(import)).extension().is_none() {
            format!("{}.{}", import, ext)
        } else {
            import.to_string()
        }
    };

    for line in content.lines() {
        for caps in JS_IMPORT.captures_iter(line) {
            imports.push(with_extension(&caps[1]));
        }
        for caps in JS_REQUIRE.captures_iter(line) {
            imports.push(with_extension(&caps[1]));
        }
        if let Some(caps) = JS_EXPORT.captures(line) {
            exports.push(caps[1].to_string());
        }
    }

    (imports, exports)
}

fn scan_python(content: &str) -> (Vec<String>, Vec<String>) {
    let mut imports = Vec::new();
    let mut exports = Vec::new();

    for line in content.lines() {
        if let Some(caps) = PY_EXPORT.captures(line) {
            if !caps[1].starts_with('_') {
                exports.push(caps[1].to_string());
            }
            continue;
        }

        let Some(caps) = PY_IMPORT.captures(line.trim()) else {
            continue;
        };
        match caps.get(1) {
            Some(module) => {
                if !module.as_str().starts_with('.') {
                    imports.push(module.as_str().to_string());
                }
            }
            None => {
                for name in caps[2].split(',') {
                    let module = name.split_whitespace().next().unwrap_or("");
                    if !module.is_empty() && !module.starts_with('.') {
                        imports.push(module.to_string());
                    }
                }
            }
        }
    }

    (imports, exports)
}

fn scan_java(content: &str) -> (Vec<String>, Vec<String>) {
    let mut imports = Vec::new();
    let mut exports = Vec::new();

    for line in content.lines() {
        if let Some(caps) = JAVA_IMPORT.captures(line) {
            if !caps[1].starts_with("java.") {
                imports.push(caps[1].to_string());
            }
        }
        if let Some(caps) = JAVA_EXPORT.captures(line) {
            exports.push(caps[1].to_string());
        }
    }

    (imports, exports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_transposed(graph: &DependencyGraph) {
        for (file, imports) in &graph.imports {
            for imported in imports {
                assert!(graph.imported_by[imported].contains(file));
            }
        }
        for (imported, importers) in &graph.imported_by {
            for importer in importers {
                assert!(graph.imports[importer].contains(imported));
            }
        }
        for (file, symbols) in &graph.exports {
            for symbol in symbols {
                assert!(graph.symbol_to_file[symbol].contains(file));
            }
        }
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("src/./a/../b.js"), "src/b.js");
        assert_eq!(clean_path("../x"), "../x");
        assert_eq!(clean_path("/a/b/../../c"), "/c");
        assert_eq!(resolve_relative("src/app/main.js", "../lib/util.js"), "src/lib/util.js");
        assert_eq!(resolve_relative("main.js", "./util.js"), "util.js");
        assert_eq!(resolve_relative("src/main.js", "react"), "react");
    }

    #[test]
    fn test_go_imports_and_exports() {
        let source = r#"package server

import "fmt"
import log "github.com/sirupsen/logrus"
import (
	"net/http"
	// "unused"
	mux "github.com/gorilla/mux"
	"example.com/x/vendor/y"
)

type Server struct{}

func NewServer() *Server { return nil }

func (s *Server) Start() {}

func helper() {}
"#;
        let mut graph = DependencyGraph::new();
        graph.analyze_file("server/server.go", source);

        assert_eq!(
            graph.imports("server/server.go", false),
            vec!["fmt", "github.com/gorilla/mux", "github.com/sirupsen/logrus", "net/http"]
        );
        assert_eq!(graph.exports("server/server.go"), vec!["NewServer", "Server"]);
        assert_transposed(&graph);
    }

    #[test]
    fn test_js_relative_imports_take_importer_extension() {
        let source = "import { a } from './util';\nconst b = require('../lib/b.js');\nimport React from 'react';\nexport function render() {}\nexport default class App {}\n";
        let mut graph = DependencyGraph::new();
        graph.analyze_file("src/app/main.ts", source);

        assert_eq!(
            graph.imports("src/app/main.ts", false),
            vec!["react", "src/app/util.ts", "src/lib/b.js"]
        );
        assert_eq!(graph.exports("src/app/main.ts"), vec!["App", "render"]);
        assert_eq!(graph.dependents("src/app/util.ts"), vec!["src/app/main.ts"]);
    }

    #[test]
    fn test_python_imports() {
        let source = "import os, sys\nimport numpy as np\nfrom app.models import User\nfrom . import sibling\n\ndef public():\n    def inner():\n        pass\n\ndef _private():\n    pass\n\nclass Service:\n    pass\n";
        let mut graph = DependencyGraph::new();
        graph.analyze_file("app/views.py", source);

        assert_eq!(
            graph.imports("app/views.py", false),
            vec!["app.models", "numpy", "os", "sys"]
        );
        assert_eq!(graph.exports("app/views.py"), vec!["Service", "public"]);
    }

    #[test]
    fn test_java_imports() {
        let source = "import java.util.List;\nimport static com.acme.Util.helper;\nimport com.acme.Model;\n\npublic final class Controller<T> {}\n";
        let mut graph = DependencyGraph::new();
        graph.analyze_file("src/Controller.java", source);

        assert_eq!(
            graph.imports("src/Controller.java", false),
            vec!["com.acme.Model", "com.acme.Util.helper"]
        );
        assert_eq!(graph.exports("src/Controller.java"), vec!["Controller"]);
    }

    #[test]
    fn test_transitive_dependents_chain() {
        let mut graph = DependencyGraph::new();
        graph.analyze_file("a.js", "import { b } from './b.js';");
        graph.analyze_file("b.js", "import { c } from './c.js';");
        graph.analyze_file("c.js", "export const c = 1;");

        assert_eq!(graph.transitive_dependents("c.js"), vec!["a.js", "b.js"]);
        assert_eq!(graph.transitive_dependents("a.js"), Vec::<String>::new());
        assert_eq!(graph.imports("a.js", true), vec!["b.js", "c.js"]);
        assert_transposed(&graph);
    }

    #[test]
    fn test_cycles_terminate() {
        let mut graph = DependencyGraph::new();
        graph.analyze_file("a.js", "import x from './b.js';");
        graph.analyze_file("b.js", "import y from './a.js';");
        assert_eq!(graph.transitive_dependents("a.js"), vec!["b.js"]);
    }

    #[test]
    fn test_reanalyze_replaces_edges() {
        let mut graph = DependencyGraph::new();
        graph.analyze_file("a.js", "import x from './b.js';\nexport const one = 1;");
        graph.analyze_file("a.js", "import x from './c.js';");

        assert!(graph.dependents("b.js").is_empty());
        assert_eq!(graph.dependents("c.js"), vec!["a.js"]);
        assert!(graph.exports("a.js").is_empty());
        assert!(graph.files_exporting("one").is_empty());
        assert_transposed(&graph);
    }

    #[test]
    fn test_remove_file() {
        let mut graph = DependencyGraph::new();
        graph.analyze_file("a.js", "import x from './b.js';");
        graph.analyze_file("b.js", "export function x() {}");
        graph.remove_file("a.js");

        assert!(graph.dependents("b.js").is_empty());
        assert_eq!(graph.files_exporting("x"), vec!["b.js"]);
        assert_eq!(graph.len(), 1);
        assert_transposed(&graph);
    }

    #[test]
    fn test_basename_heuristic() {
        let mut graph = DependencyGraph::new();
        graph.analyze_file("pkg/util/strings.go", "package util\n\nfunc Reverse() {}\n");
        graph.analyze_file(
            "cmd/main.go",
            "package main\n\nimport \"example.com/pkg/util/strings.go\"\n",
        );
        assert_eq!(graph.dependents("pkg/util/strings.go"), vec!["cmd/main.go"]);
    }

    #[test]
    fn test_unknown_language_ignored() {
        let mut graph = DependencyGraph::new();
        graph.analyze_file("notes.txt", "import everything");
        assert!(graph.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps").join("dependencies.json");

        let mut graph = DependencyGraph::new();
        graph.analyze_file("a.js", "import x from './b.js';");
        graph.save(&path).unwrap();

        let loaded = DependencyGraph::load(&path).unwrap();
        assert_eq!(loaded.dependents("b.js"), vec!["a.js"]);
        assert!(DependencyGraph::load(&dir.path().join("missing.json")).unwrap().is_empty());
    }
}
