//! AST-aware code chunking using tree-sitter.
//!
//! Sources with a grammar (Rust, Python, JavaScript, TypeScript, Go) are
//! split at function, method and type boundaries. Other languages, and
//! sources that yield no declarations, fall back to brace or indentation
//! block extraction and finally to an overlapping sliding window.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use coderag_config::ChunkingConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use tree_sitter::{Language, Node, Parser};
use uuid::Uuid;

/// Cap on symbols stored per chunk.
const MAX_SYMBOLS: usize = 200;

/// Module docs shorter than this are not worth a chunk.
const MIN_MODULE_DOC_CHARS: usize = 20;

/// Errors that can occur during code chunking.
#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("Unsupported file type: {0}")]
    UnsupportedFile(String),

    #[error("Failed to load {0} grammar: {1}")]
    Grammar(&'static str, String),
}

/// Type of code chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Function,
    Method,
    Type,
    Module,
    Block,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Type => "type",
            Self::Module => "module",
            Self::Block => "block",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(Self::Function),
            "method" => Some(Self::Method),
            "type" => Some(Self::Type),
            "module" => Some(Self::Module),
            "block" => Some(Self::Block),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk of code extracted from a source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// The source text of this chunk
    pub code: String,
    pub language: String,
    pub file_path: String,
    /// First line (1-indexed, inclusive)
    pub line_start: usize,
    /// Last line (1-indexed, inclusive)
    pub line_end: usize,
    pub chunk_type: ChunkType,
    pub name: String,
    /// Collection the chunk is indexed into
    pub repository: String,
    pub symbols: Vec<String>,
    pub signature: Option<String>,
    /// Package clause and imports of the enclosing file
    pub file_context: String,
    /// Header of the enclosing class or impl block, for methods
    pub parent_context: Option<String>,
}

impl Chunk {
    /// Deterministic identifier derived from path, line span and type.
    ///
    /// Re-chunking an unchanged region yields the same id, so upserts are
    /// idempotent. The value is a UUID so it is accepted as a Qdrant point id.
    pub fn id(&self) -> String {
        chunk_id(&self.file_path, self.line_start, self.line_end, self.chunk_type)
    }

    /// `path:start-end`, used to deduplicate results.
    pub fn location_key(&self) -> String {
        format!("{}:{}-{}", self.file_path, self.line_start, self.line_end)
    }

    /// Text sent to the embedding model: context first, then the code.
    pub fn embedding_text(&self) -> String {
        let mut text = String::new();
        if !self.file_context.is_empty() {
            text.push_str(&self.file_context);
            text.push_str("\n\n");
        }
        if let Some(parent) = &self.parent_context {
            text.push_str("// In: ");
            text.push_str(parent);
            text.push('\n');
        }
        text.push_str(&self.code);
        text
    }
}

/// Compute the id of the chunk at `path:start-end` with the given type.
pub fn chunk_id(file_path: &str, line_start: usize, line_end: usize, chunk_type: ChunkType) -> String {
    let key = format!("{}:{}-{}:{}", file_path, line_start, line_end, chunk_type);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

/// Code chunker that uses tree-sitter for AST-aware chunking.
pub struct CodeChunker {
    config: ChunkingConfig,
    grammars: HashMap<&'static str, Language>,
}

impl CodeChunker {
    /// Create a chunker, loading every bundled grammar.
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        let grammars: [(&'static str, Language); 6] = [
            ("rust", tree_sitter_rust::LANGUAGE.into()),
            ("python", tree_sitter_python::LANGUAGE.into()),
            ("javascript", tree_sitter_javascript::LANGUAGE.into()),
            ("typescript", tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            ("tsx", tree_sitter_typescript::LANGUAGE_TSX.into()),
            ("go", tree_sitter_go::LANGUAGE.into()),
        ];

        let mut map = HashMap::new();
        for (name, language) in grammars {
            // Fail early on an ABI mismatch rather than on the first file
            let mut parser = Parser::new();
            parser
                .set_language(&language)
                .map_err(|e| ChunkerError::Grammar(name, e.to_string()))?;
            map.insert(name, language);
        }
        // JSX parses with the JavaScript grammar
        if let Some(js) = map.get("javascript").cloned() {
            map.insert("jsx", js);
        }

        Ok(Self {
            config,
            grammars: map,
        })
    }

    /// Create a chunker with default settings.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ChunkingConfig::default())
    }

    /// Detect language from file extension.
    pub fn detect_language(path: &Path) -> Option<&'static str> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        let language = match ext.as_str() {
            "go" => "go",
            "rs" => "rust",
            "py" => "python",
            "js" | "mjs" | "cjs" => "javascript",
            "jsx" => "jsx",
            "ts" => "typescript",
            "tsx" => "tsx",
            "java" => "java",
            "c" | "h" => "c",
            "cpp" | "cc" | "cxx" | "hpp" => "cpp",
            "cs" => "csharp",
            "rb" => "ruby",
            "php" => "php",
            "swift" => "swift",
            "kt" => "kotlin",
            "scala" => "scala",
            "sh" | "bash" | "zsh" => "bash",
            "yml" | "yaml" => "yaml",
            "json" => "json",
            "xml" => "xml",
            "html" => "html",
            "css" => "css",
            "scss" => "scss",
            "sql" => "sql",
            _ => return None,
        };
        Some(language)
    }

    /// Whether `language` is parsed with tree-sitter.
    pub fn has_grammar(&self, language: &str) -> bool {
        self.grammars.contains_key(language)
    }

    /// Chunk a single file into semantic code blocks.
    pub fn chunk_file(&self, path: &Path) -> Result<Vec<Chunk>> {
        let language = Self::detect_language(path)
            .ok_or_else(|| ChunkerError::UnsupportedFile(path.display().to_string()))?;

        let bytes =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let source = String::from_utf8_lossy(&bytes);
        let file_path = path.to_string_lossy();

        Ok(self.chunk_source(&source, &file_path, language))
    }

    /// Chunk source text. Never fails; empty input gives no chunks.
    pub fn chunk_source(&self, source: &str, file_path: &str, language: &str) -> Vec<Chunk> {
        if source.trim().is_empty() {
            return Vec::new();
        }

        let lines: Vec<&str> = source.lines().collect();
        let file_context = if self.config.include_context {
            file_context(&lines, language, self.config.max_context_lines)
        } else {
            String::new()
        };
        let ctx = SourceCtx {
            source,
            lines: &lines,
            file_path,
            language,
            file_context: &file_context,
        };

        let mut chunks = self.ast_chunks(&ctx).unwrap_or_default();
        if chunks.is_empty() {
            chunks = block_chunks(&ctx);
        }
        if chunks.is_empty() {
            chunks = self.window_chunks(&ctx);
        }
        if let Some(module) = module_chunk(&ctx) {
            chunks.insert(0, module);
        }

        let mut seen = HashSet::new();
        chunks.retain(|c| seen.insert(c.id()));

        debug!(
            file = file_path,
            language,
            chunks = chunks.len(),
            "Chunked source"
        );
        chunks
    }

    /// Declarations found by the syntax tree, or `None` without a grammar.
    fn ast_chunks(&self, ctx: &SourceCtx) -> Option<Vec<Chunk>> {
        let language = self.grammars.get(ctx.language)?;
        let mut parser = Parser::new();
        parser.set_language(language).ok()?;
        let tree = parser.parse(ctx.source, None)?;
        let root = tree.root_node();

        let mut chunks = Vec::new();
        for child in root.named_children(&mut root.walk()) {
            visit_node(child, ctx, None, &mut chunks);
        }

        if chunks.is_empty() && root.has_error() {
            debug!(file = ctx.file_path, "Parse errors, falling back to block chunking");
        }
        Some(chunks)
    }

    fn window_chunks(&self, ctx: &SourceCtx) -> Vec<Chunk> {
        let lines = ctx.lines;
        let size = self.config.max_chunk_lines.max(1);
        let step = size.saturating_sub(self.config.overlap_lines).max(1);

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < lines.len() {
            let end = (start + size).min(lines.len());
            let code = lines[start..end].join("\n");
            if code.trim().len() >= self.config.min_chunk_chars {
                chunks.push(ctx.chunk(
                    code,
                    start + 1,
                    end,
                    ChunkType::Block,
                    format!("block_{}_{}", start + 1, end),
                    None,
                ));
            }
            if end == lines.len() {
                break;
            }
            start += step;
        }
        chunks
    }
}

/// Per-file state shared by the extraction passes.
struct SourceCtx<'a> {
    source: &'a str,
    lines: &'a [&'a str],
    file_path: &'a str,
    language: &'a str,
    file_context: &'a str,
}

impl SourceCtx<'_> {
    fn chunk(
        &self,
        code: String,
        line_start: usize,
        line_end: usize,
        chunk_type: ChunkType,
        name: String,
        parent_context: Option<String>,
    ) -> Chunk {
        let signature = signature(&code, chunk_type);
        Chunk {
            symbols: extract_symbols(&code, self.language),
            code,
            language: self.language.to_string(),
            file_path: self.file_path.to_string(),
            line_start,
            line_end,
            chunk_type,
            name,
            repository: String::new(),
            signature,
            file_context: self.file_context.to_string(),
            parent_context,
        }
    }

    fn node_chunk(
        &self,
        span: Node,
        chunk_type: ChunkType,
        name: String,
        parent_context: Option<String>,
    ) -> Chunk {
        let (start, end) = node_lines(span);
        let code = self.source[span.byte_range()].to_string();
        self.chunk(code, start, end, chunk_type, name, parent_context)
    }

    /// Chunk covering whole lines `start..=end` (1-indexed).
    fn line_chunk(
        &self,
        start: usize,
        end: usize,
        chunk_type: ChunkType,
        name: String,
    ) -> Option<Chunk> {
        let mut end = end.min(self.lines.len());
        while end > start && self.lines[end - 1].trim().is_empty() {
            end -= 1;
        }
        if start == 0 || start > end {
            return None;
        }
        let code = self.lines[start - 1..end].join("\n");
        Some(self.chunk(code, start, end, chunk_type, name, None))
    }
}

/// 1-indexed inclusive line span of a node.
fn node_lines(node: Node) -> (usize, usize) {
    let start = node.start_position().row + 1;
    let end_pos = node.end_position();
    let end = if end_pos.column == 0 && end_pos.row + 1 > start {
        end_pos.row
    } else {
        end_pos.row + 1
    };
    (start, end)
}

fn field_text(node: Node, field: &str, source: &str) -> Option<String> {
    node.child_by_field_name(field)
        .map(|n| source[n.byte_range()].to_string())
}

fn first_descendant<'t>(node: Node<'t>, kind: &str) -> Option<Node<'t>> {
    if node.kind() == kind {
        return Some(node);
    }
    for child in node.named_children(&mut node.walk()) {
        if let Some(found) = first_descendant(child, kind) {
            return Some(found);
        }
    }
    None
}

/// First line of a declaration without the opening brace or colon.
fn header_text(node: Node, source: &str) -> String {
    let text = &source[node.byte_range()];
    text.lines()
        .next()
        .unwrap_or_default()
        .trim()
        .trim_end_matches('{')
        .trim_end_matches(':')
        .trim()
        .to_string()
}

fn visit_node(node: Node, ctx: &SourceCtx, scope: Option<&str>, out: &mut Vec<Chunk>) {
    match node.kind() {
        "export_statement" => {
            if let Some(decl) = node.child_by_field_name("declaration") {
                visit_decl(node, decl, ctx, scope, out);
            }
        }
        "decorated_definition" => {
            if let Some(def) = node.child_by_field_name("definition") {
                visit_decl(node, def, ctx, scope, out);
            }
        }
        _ => visit_decl(node, node, ctx, scope, out),
    }
}

/// Emit chunks for `decl`, using `span` (which may include an `export`
/// keyword or decorators) for the text and line range.
fn visit_decl(span: Node, decl: Node, ctx: &SourceCtx, scope: Option<&str>, out: &mut Vec<Chunk>) {
    let source = ctx.source;
    match decl.kind() {
        "function_item"
        | "function_definition"
        | "function_declaration"
        | "generator_function_declaration" => {
            if let Some(name) = field_text(decl, "name", source) {
                let kind = if scope.is_some() {
                    ChunkType::Method
                } else {
                    ChunkType::Function
                };
                out.push(ctx.node_chunk(span, kind, name, scope.map(String::from)));
            }
        }
        "method_definition" => {
            if let Some(name) = field_text(decl, "name", source) {
                out.push(ctx.node_chunk(span, ChunkType::Method, name, scope.map(String::from)));
            }
        }
        // Go methods live at top level; the receiver type is the parent
        "method_declaration" => {
            if let Some(name) = field_text(decl, "name", source) {
                let receiver = decl
                    .child_by_field_name("receiver")
                    .and_then(|r| first_descendant(r, "type_identifier"))
                    .map(|t| format!("type {}", &source[t.byte_range()]));
                out.push(ctx.node_chunk(span, ChunkType::Method, name, receiver));
            }
        }
        "struct_item" | "enum_item" | "trait_item" | "type_item" | "union_item"
        | "interface_declaration" | "type_alias_declaration" | "enum_declaration" => {
            if let Some(name) = field_text(decl, "name", source) {
                out.push(ctx.node_chunk(span, ChunkType::Type, name, None));
            }
        }
        "type_declaration" => {
            let specs: Vec<Node> = decl
                .named_children(&mut decl.walk())
                .filter(|c| matches!(c.kind(), "type_spec" | "type_alias"))
                .collect();
            let single = specs.len() == 1;
            for spec in specs {
                if let Some(name) = field_text(spec, "name", source) {
                    let range = if single { span } else { spec };
                    out.push(ctx.node_chunk(range, ChunkType::Type, name, None));
                }
            }
        }
        "class_definition" | "class_declaration" | "abstract_class_declaration" => {
            visit_class(span, decl, ctx, out);
        }
        "impl_item" => {
            let header = header_text(decl, source);
            let mut methods = Vec::new();
            if let Some(body) = decl.child_by_field_name("body") {
                for child in body.named_children(&mut body.walk()) {
                    visit_node(child, ctx, Some(&header), &mut methods);
                }
            }
            if methods.is_empty() {
                let name = field_text(decl, "type", source).unwrap_or(header);
                out.push(ctx.node_chunk(span, ChunkType::Type, name, None));
            } else {
                out.extend(methods);
            }
        }
        "mod_item" => {
            if let Some(body) = decl.child_by_field_name("body") {
                for child in body.named_children(&mut body.walk()) {
                    visit_node(child, ctx, scope, out);
                }
            }
        }
        "lexical_declaration" | "variable_declaration" => {
            for declarator in decl.named_children(&mut decl.walk()) {
                if declarator.kind() != "variable_declarator" {
                    continue;
                }
                let is_function = declarator
                    .child_by_field_name("value")
                    .map(|v| {
                        matches!(
                            v.kind(),
                            "arrow_function" | "function_expression" | "function"
                        )
                    })
                    .unwrap_or(false);
                if !is_function {
                    continue;
                }
                if let Some(name) = field_text(declarator, "name", source) {
                    out.push(ctx.node_chunk(span, ChunkType::Function, name, None));
                }
            }
        }
        _ => {}
    }
}

/// A class yields its methods plus a type chunk covering the header
/// (docstring, fields) up to the first method.
fn visit_class(span: Node, decl: Node, ctx: &SourceCtx, out: &mut Vec<Chunk>) {
    let Some(name) = field_text(decl, "name", ctx.source) else {
        return;
    };
    let header = header_text(decl, ctx.source);

    let mut members = Vec::new();
    if let Some(body) = decl.child_by_field_name("body") {
        for child in body.named_children(&mut body.walk()) {
            visit_node(child, ctx, Some(&header), &mut members);
        }
    }

    let (start, end) = node_lines(span);
    let first_member = members.iter().map(|c| c.line_start).min();
    let class_chunk = match first_member {
        Some(line) if line > start => ctx.line_chunk(start, line - 1, ChunkType::Type, name),
        Some(_) => None,
        None => ctx.line_chunk(start, end, ChunkType::Type, name),
    };

    out.extend(class_chunk);
    out.extend(members);
}

static GO_PACKAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^package\s+(\w+)").expect("valid package regex"));

/// Module-level documentation as its own chunk.
fn module_chunk(ctx: &SourceCtx) -> Option<Chunk> {
    let lines = ctx.lines;
    let stem = Path::new(ctx.file_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let (start, end, doc, code, name) = match ctx.language {
        "go" => {
            let pkg_idx = lines.iter().position(|l| GO_PACKAGE.is_match(l))?;
            let package = GO_PACKAGE.captures(lines[pkg_idx])?.get(1)?.as_str().to_string();
            let mut first = pkg_idx;
            while first > 0 && lines[first - 1].trim_start().starts_with("//") {
                first -= 1;
            }
            if first == pkg_idx {
                return None;
            }
            let doc = strip_comment_lines(&lines[first..pkg_idx], "//");
            let code = format!("package {}\n\n{}", package, doc);
            (first + 1, pkg_idx, doc, code, format!("package {}", package))
        }
        "rust" => {
            let first = lines.iter().position(|l| !l.trim().is_empty())?;
            let count = lines[first..]
                .iter()
                .take_while(|l| l.trim_start().starts_with("//!"))
                .count();
            if count == 0 {
                return None;
            }
            let doc = strip_comment_lines(&lines[first..first + count], "//!");
            let code = lines[first..first + count].join("\n");
            (first + 1, first + count, doc, code, stem)
        }
        "python" => {
            let first = lines.iter().position(|l| {
                let t = l.trim();
                !t.is_empty() && !t.starts_with('#')
            })?;
            let opening = lines[first].trim_start();
            let quote = ["\"\"\"", "'''"]
                .into_iter()
                .find(|q| opening.trim_start_matches(['r', 'u', 'R', 'U']).starts_with(q))?;
            let after_open = &opening[opening.find(quote)? + 3..];
            let last = if after_open.contains(quote) {
                first
            } else {
                first + 1 + lines[first + 1..].iter().position(|l| l.contains(quote))?
            };
            let code = lines[first..=last].join("\n");
            let doc = code.replace(quote, "").trim().to_string();
            (first + 1, last + 1, doc, code, stem)
        }
        "javascript" | "jsx" | "typescript" | "tsx" => {
            let first = lines.iter().position(|l| !l.trim().is_empty())?;
            let opening = lines[first].trim_start();
            let last = if opening.starts_with("/*") {
                first + lines[first..].iter().position(|l| l.contains("*/"))?
            } else if opening.starts_with("//") {
                first + lines[first..]
                    .iter()
                    .take_while(|l| l.trim_start().starts_with("//"))
                    .count()
                    - 1
            } else {
                return None;
            };
            let code = lines[first..=last].join("\n");
            let doc = code
                .lines()
                .map(|l| {
                    l.trim()
                        .trim_start_matches("/**")
                        .trim_start_matches("/*")
                        .trim_end_matches("*/")
                        .trim_start_matches("//")
                        .trim_start_matches('*')
                        .trim()
                })
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            (first + 1, last + 1, doc, code, stem)
        }
        _ => return None,
    };

    if doc.trim().len() <= MIN_MODULE_DOC_CHARS {
        return None;
    }
    Some(ctx.chunk(code, start, end, ChunkType::Module, name, None))
}

fn strip_comment_lines(lines: &[&str], marker: &str) -> String {
    lines
        .iter()
        .map(|l| l.trim_start().trim_start_matches(marker).trim())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Package clause and import lines, bounded by `max_lines`.
fn file_context(lines: &[&str], language: &str, max_lines: usize) -> String {
    let prefixes: &[&str] = match language {
        "go" => &["package ", "import "],
        "rust" => &["use ", "pub use ", "extern crate "],
        "python" => &["import ", "from "],
        "javascript" | "jsx" | "typescript" | "tsx" => &["import ", "const ", "require("],
        "java" | "kotlin" | "scala" => &["package ", "import "],
        "c" | "cpp" => &["#include"],
        "csharp" => &["using ", "namespace "],
        "php" => &["namespace ", "use "],
        "ruby" => &["require ", "require_relative "],
        "swift" => &["import "],
        _ => return String::new(),
    };

    let mut context = Vec::new();
    let mut in_go_block = false;
    for line in lines {
        if context.len() >= max_lines {
            break;
        }
        if in_go_block {
            context.push(line.trim_end());
            if line.trim() == ")" {
                in_go_block = false;
            }
            continue;
        }
        // Top-level statements only
        if line.starts_with(char::is_whitespace) {
            continue;
        }
        let matches = prefixes.iter().any(|p| line.starts_with(p));
        if !matches {
            continue;
        }
        // `const` lines only count as context when they require a module
        if line.starts_with("const ") && !line.contains("require(") {
            continue;
        }
        if language == "go" && line.trim_end() == "import (" {
            in_go_block = true;
        }
        context.push(line.trim_end());
    }
    context.join("\n")
}

fn signature(code: &str, chunk_type: ChunkType) -> Option<String> {
    match chunk_type {
        ChunkType::Function | ChunkType::Method => code
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('@') && !l.starts_with("#["))
            .map(|l| l.trim_end_matches('{').trim().to_string()),
        ChunkType::Type => match code.find('{') {
            Some(pos) => Some(code[..pos].trim().to_string()),
            None => code.lines().next().map(|s| s.trim().to_string()),
        },
        ChunkType::Module | ChunkType::Block => None,
    }
}

static DEFINITION_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:(?:export|default|pub(?:\([^)]*\))?|public|private|protected|internal|static|final|abstract|async|override|open|virtual|inline|unsafe|extern|const|suspend|sealed|data|partial)\s+)*(func|fn|function|def|class|struct|interface|enum|trait|impl|type|object|module|fun)\b",
    )
    .expect("valid definition regex")
});

static DEFINITION_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:func|fn|function|def|class|struct|interface|enum|trait|impl|type|object|module|fun)\s+(?:\([^)]*\)\s*)?(?:<[^>]*>\s*)?([A-Za-z_$][\w$]*)",
    )
    .expect("valid definition name regex")
});

static C_STYLE_DEFINITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][\w\s\*&:<>,\[\]]*?\b([A-Za-z_]\w*)\s*\([^;]*\)\s*(?:const\s*)?(?:throws\s+[\w\s,.]+)?\{?\s*$")
        .expect("valid c-style definition regex")
});

const CONTROL_KEYWORDS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "else", "foreach", "using", "lock", "elif",
];

fn indentation_language(language: &str) -> bool {
    matches!(language, "python" | "ruby")
}

fn brace_language(language: &str) -> bool {
    matches!(
        language,
        "go" | "rust"
            | "javascript"
            | "jsx"
            | "typescript"
            | "tsx"
            | "java"
            | "c"
            | "cpp"
            | "csharp"
            | "php"
            | "swift"
            | "kotlin"
            | "scala"
    )
}

/// Detect a definition header; returns its name and chunk type.
fn definition_at(line: &str) -> Option<(String, ChunkType)> {
    let trimmed = line.trim();
    if let Some(caps) = DEFINITION_START.captures(trimmed) {
        let keyword = caps.get(1)?.as_str();
        let chunk_type = match keyword {
            "class" | "struct" | "interface" | "enum" | "trait" | "impl" | "type" | "object"
            | "module" => ChunkType::Type,
            _ => ChunkType::Function,
        };
        let name = DEFINITION_NAME
            .captures(trimmed)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| keyword.to_string());
        return Some((name, chunk_type));
    }
    let caps = C_STYLE_DEFINITION.captures(trimmed)?;
    let name = caps.get(1)?.as_str();
    if CONTROL_KEYWORDS.contains(&name) {
        return None;
    }
    let first_word = trimmed.split_whitespace().next().unwrap_or_default();
    if CONTROL_KEYWORDS.contains(&first_word.trim_end_matches('(')) {
        return None;
    }
    Some((name.to_string(), ChunkType::Function))
}

/// Definition blocks found without a parser.
fn block_chunks(ctx: &SourceCtx) -> Vec<Chunk> {
    let lines = ctx.lines;
    let mut chunks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some((name, chunk_type)) = definition_at(lines[i]) else {
            i += 1;
            continue;
        };

        let end = if indentation_language(ctx.language) {
            indentation_block_end(lines, i)
        } else if brace_language(ctx.language) {
            brace_block_end(lines, i, ctx.language != "rust")
        } else {
            None
        };

        match end {
            Some(end) => {
                let start = decorator_start(lines, i);
                if let Some(chunk) = ctx.line_chunk(start + 1, end + 1, chunk_type, name) {
                    chunks.push(chunk);
                }
                i = end + 1;
            }
            None => i += 1,
        }
    }
    chunks
}

/// Include decorator or attribute lines directly above a definition.
fn decorator_start(lines: &[&str], start: usize) -> usize {
    let mut first = start;
    while first > 0 {
        let above = lines[first - 1].trim();
        if above.starts_with('@') || above.starts_with("#[") {
            first -= 1;
        } else {
            break;
        }
    }
    first
}

/// Last line (0-indexed) of an indentation-delimited block.
fn indentation_block_end(lines: &[&str], start: usize) -> Option<usize> {
    let indent = |l: &str| l.len() - l.trim_start().len();
    let base = indent(lines[start]);
    let mut end = start;
    for (idx, line) in lines.iter().enumerate().skip(start + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent(line) <= base {
            // Ruby closes blocks with `end` at the opening indentation
            if line.trim() == "end" && indent(line) == base {
                end = idx;
            }
            break;
        }
        end = idx;
    }
    Some(end)
}

/// Last line (0-indexed) of a brace-delimited block starting at `start`.
///
/// Gives up when a `;` ends the statement before any `{`, or when no brace
/// opens within a few lines.
fn brace_block_end(lines: &[&str], start: usize, single_quote_strings: bool) -> Option<usize> {
    const MAX_HEADER_LINES: usize = 3;

    let mut depth = 0usize;
    let mut opened = false;
    let mut in_string: Option<char> = None;

    for (idx, line) in lines.iter().enumerate().skip(start) {
        if !opened && idx >= start + MAX_HEADER_LINES {
            return None;
        }
        let mut prev = '\0';
        let mut chars = line.chars().peekable();
        while let Some(ch) = chars.next() {
            match in_string {
                Some(quote) => {
                    if ch == quote && prev != '\\' {
                        in_string = None;
                    }
                }
                None => match ch {
                    '/' if chars.peek() == Some(&'/') => break,
                    '"' | '`' => in_string = Some(ch),
                    '\'' if single_quote_strings => in_string = Some(ch),
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => {
                        depth = depth.saturating_sub(1);
                        if opened && depth == 0 {
                            return Some(idx);
                        }
                    }
                    ';' if !opened => return None,
                    _ => {}
                },
            }
            prev = if prev == '\\' && ch == '\\' { '\0' } else { ch };
        }
        // Template literals may span lines; other strings may not
        if in_string != Some('`') {
            in_string = None;
        }
    }
    None
}

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-zA-Z_]\w+\b").expect("valid identifier regex"));

static SYMBOL_PATTERNS: Lazy<HashMap<&'static str, Vec<Regex>>> = Lazy::new(|| {
    let compile = |patterns: &[&str]| -> Vec<Regex> {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("valid symbol regex"))
            .collect()
    };
    let js = compile(&[
        r"function\s+(\w+)",
        r"class\s+(\w+)",
        r"const\s+(\w+)",
        r"let\s+(\w+)",
        r"var\s+(\w+)",
    ]);
    let mut map = HashMap::new();
    map.insert(
        "go",
        compile(&[
            r"func\s+(\w+)",
            r"type\s+(\w+)",
            r"var\s+(\w+)",
            r"const\s+(\w+)",
            r"interface\s+(\w+)",
        ]),
    );
    map.insert(
        "rust",
        compile(&[
            r"fn\s+(\w+)",
            r"struct\s+(\w+)",
            r"enum\s+(\w+)",
            r"trait\s+(\w+)",
        ]),
    );
    map.insert("python", compile(&[r"def\s+(\w+)", r"class\s+(\w+)"]));
    for lang in ["javascript", "jsx", "typescript", "tsx"] {
        map.insert(lang, js.clone());
    }
    map.insert("default", compile(&[r"(\w+)\s*\(", r"(\w+)\s*="]));
    map
});

/// Declared names first, then every identifier longer than two characters.
pub fn extract_symbols(code: &str, language: &str) -> Vec<String> {
    let patterns = SYMBOL_PATTERNS
        .get(language)
        .or_else(|| SYMBOL_PATTERNS.get("default"));

    let mut seen = HashSet::new();
    let mut symbols = Vec::new();
    let mut push = |s: &str| {
        if symbols.len() < MAX_SYMBOLS && seen.insert(s.to_string()) {
            symbols.push(s.to_string());
        }
    };

    for re in patterns.into_iter().flatten() {
        for caps in re.captures_iter(code) {
            if let Some(m) = caps.get(1) {
                push(m.as_str());
            }
        }
    }
    for m in IDENTIFIER.find_iter(code) {
        if m.as_str().len() > 2 {
            push(m.as_str());
        }
    }
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> CodeChunker {
        CodeChunker::with_defaults().unwrap()
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(CodeChunker::detect_language(Path::new("foo.rs")), Some("rust"));
        assert_eq!(CodeChunker::detect_language(Path::new("bar.py")), Some("python"));
        assert_eq!(CodeChunker::detect_language(Path::new("baz.js")), Some("javascript"));
        assert_eq!(CodeChunker::detect_language(Path::new("qux.ts")), Some("typescript"));
        assert_eq!(CodeChunker::detect_language(Path::new("App.tsx")), Some("tsx"));
        assert_eq!(CodeChunker::detect_language(Path::new("main.go")), Some("go"));
        assert_eq!(CodeChunker::detect_language(Path::new("Main.java")), Some("java"));
        assert_eq!(CodeChunker::detect_language(Path::new("unknown.xyz")), None);
        assert_eq!(CodeChunker::detect_language(Path::new("Makefile")), None);
    }

    #[test]
    fn test_chunk_go_functions_with_package_doc() {
        let source = r#"
// Package greet provides friendly greetings for tests.
package greet

import "fmt"

// Hello returns a greeting.
func Hello(name string) string {
	return fmt.Sprintf("hello %s", name)
}

// Goodbye returns a farewell.
func Goodbye(name string) string {
	msg := fmt.Sprintf("bye %s", name)
	return msg
}

// Shout is unused in this file.
var shout = true
"#
        .trim_start();

        let chunks = chunker().chunk_source(source, "greet/greet.go", "go");

        let functions: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::Function)
            .collect();
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].name, "Hello");
        assert_eq!((functions[0].line_start, functions[0].line_end), (7, 9));
        assert_eq!(functions[1].name, "Goodbye");
        assert_eq!((functions[1].line_start, functions[1].line_end), (12, 15));

        let module = chunks
            .iter()
            .find(|c| c.chunk_type == ChunkType::Module)
            .expect("package doc chunk");
        assert_eq!(module.name, "package greet");
        assert!(module.code.starts_with("package greet\n\n"));
        assert_eq!(chunks.len(), 3);

        assert!(functions[0].file_context.contains("package greet"));
        assert!(functions[0].file_context.contains("import \"fmt\""));
    }

    #[test]
    fn test_chunk_go_methods_and_types() {
        let source = r#"package store

type Store struct {
	items map[string]string
}

func (s *Store) Get(key string) string {
	return s.items[key]
}
"#;
        let chunks = chunker().chunk_source(source, "store.go", "go");
        let ty = chunks.iter().find(|c| c.chunk_type == ChunkType::Type).unwrap();
        assert_eq!(ty.name, "Store");
        let method = chunks.iter().find(|c| c.chunk_type == ChunkType::Method).unwrap();
        assert_eq!(method.name, "Get");
        assert_eq!(method.parent_context.as_deref(), Some("type Store"));
    }

    #[test]
    fn test_chunk_rust_source() {
        let source = r#"
pub struct Foo {
    x: i32,
}

impl Foo {
    pub fn new(x: i32) -> Self {
        Self { x }
    }

    pub fn get_x(&self) -> i32 {
        self.x
    }
}

pub fn standalone() -> i32 {
    42
}
"#;
        let chunks = chunker().chunk_source(source, "test.rs", "rust");

        let struct_chunk = chunks.iter().find(|c| c.chunk_type == ChunkType::Type).unwrap();
        assert_eq!(struct_chunk.name, "Foo");

        let methods: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::Method)
            .collect();
        assert_eq!(methods.len(), 2);
        assert!(methods
            .iter()
            .all(|m| m.parent_context.as_deref() == Some("impl Foo")));

        let standalone = chunks
            .iter()
            .find(|c| c.chunk_type == ChunkType::Function)
            .unwrap();
        assert_eq!(standalone.name, "standalone");
        assert_eq!(standalone.signature.as_deref(), Some("pub fn standalone() -> i32"));
    }

    #[test]
    fn test_chunk_rust_module_doc_and_nested_mod() {
        let source = r#"//! Utilities for computing checksums of files.

mod inner {
    pub fn checksum(data: &[u8]) -> u32 {
        data.iter().map(|b| *b as u32).sum()
    }
}
"#;
        let chunks = chunker().chunk_source(source, "src/sum.rs", "rust");
        assert_eq!(chunks[0].chunk_type, ChunkType::Module);
        assert_eq!(chunks[0].name, "sum");
        assert!(chunks
            .iter()
            .any(|c| c.chunk_type == ChunkType::Function && c.name == "checksum"));
    }

    #[test]
    fn test_chunk_python_class_methods() {
        let source = r#"class Greeter:
    """Greets people."""

    def __init__(self, name):
        self.name = name

    def greet(self):
        return "hi " + self.name


def standalone():
    return 42
"#;
        let chunks = chunker().chunk_source(source, "greeter.py", "python");

        let class_chunk = chunks.iter().find(|c| c.chunk_type == ChunkType::Type).unwrap();
        assert_eq!(class_chunk.name, "Greeter");
        assert_eq!((class_chunk.line_start, class_chunk.line_end), (1, 2));

        let methods: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::Method)
            .collect();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].name, "__init__");
        assert_eq!(methods[0].parent_context.as_deref(), Some("class Greeter"));

        let func = chunks
            .iter()
            .find(|c| c.chunk_type == ChunkType::Function)
            .unwrap();
        assert_eq!(func.name, "standalone");
        assert_eq!((func.line_start, func.line_end), (11, 12));
    }

    #[test]
    fn test_chunk_typescript_exports() {
        let source = r#"import { User } from './user';

export interface Repo {
  find(id: string): User;
}

export const loadUser = async (id: string): Promise<User> => {
  return fetchUser(id);
};

export function saveUser(user: User): void {
  console.log(user);
}
"#;
        let chunks = chunker().chunk_source(source, "src/repo.ts", "typescript");
        let names: Vec<&str> = chunks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Repo", "loadUser", "saveUser"]);
        assert_eq!(chunks[0].chunk_type, ChunkType::Type);
        assert!(chunks[1].code.starts_with("export const loadUser"));
        assert!(chunks[2]
            .file_context
            .contains("import { User } from './user';"));
    }

    #[test]
    fn test_chunk_javascript_class() {
        let source = r#"class Counter {
  constructor() {
    this.count = 0;
  }

  increment() {
    this.count += 1;
  }
}
"#;
        let chunks = chunker().chunk_source(source, "counter.js", "javascript");
        let methods: Vec<&str> = chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::Method)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(methods, vec!["constructor", "increment"]);
        assert!(chunks
            .iter()
            .any(|c| c.chunk_type == ChunkType::Type && c.name == "Counter"));
    }

    #[test]
    fn test_fallback_brace_blocks_for_java() {
        let source = r#"package demo;

import java.util.List;

public class Totals {
    public int sum(List<Integer> values) {
        int total = 0;
        for (int v : values) { total += v; }
        return total;
    }
}
"#;
        let chunks = chunker().chunk_source(source, "Totals.java", "java");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].name, "Totals");
        assert_eq!(chunks[0].chunk_type, ChunkType::Type);
        assert_eq!((chunks[0].line_start, chunks[0].line_end), (5, 11));
        assert!(chunks[0].file_context.contains("import java.util.List;"));
    }

    #[test]
    fn test_fallback_indentation_blocks_for_ruby() {
        let source = "class Greeter\n  def hello\n    puts 'hi'\n  end\nend\n";
        let chunks = chunker().chunk_source(source, "greeter.rb", "ruby");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].name, "Greeter");
        assert_eq!((chunks[0].line_start, chunks[0].line_end), (1, 5));
    }

    #[test]
    fn test_sliding_window_fallback() {
        let config = ChunkingConfig {
            max_chunk_lines: 10,
            overlap_lines: 4,
            min_chunk_chars: 5,
            ..Default::default()
        };
        let chunker = CodeChunker::new(config).unwrap();
        let source: String = (1..=20).map(|i| format!("key_{i}: value_{i}\n")).collect();

        let chunks = chunker.chunk_source(&source, "settings.yaml", "yaml");
        let spans: Vec<(usize, usize)> = chunks.iter().map(|c| (c.line_start, c.line_end)).collect();
        assert_eq!(spans, vec![(1, 10), (7, 16), (13, 20)]);
        assert!(chunks.iter().all(|c| c.chunk_type == ChunkType::Block));
    }

    #[test]
    fn test_sliding_window_drops_tiny_windows() {
        let chunks = chunker().chunk_source("a: 1\n", "tiny.yaml", "yaml");
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_empty_source() {
        assert!(chunker().chunk_source("   \n", "empty.go", "go").is_empty());
    }

    #[test]
    fn test_chunk_ids_are_deterministic() {
        let source = "fn a() {}\n\nfn b() {}\n";
        let first = chunker().chunk_source(source, "lib.rs", "rust");
        let second = chunker().chunk_source(source, "lib.rs", "rust");
        let ids1: Vec<String> = first.iter().map(Chunk::id).collect();
        let ids2: Vec<String> = second.iter().map(Chunk::id).collect();
        assert_eq!(ids1, ids2);
        assert_ne!(ids1[0], ids1[1]);
        assert!(Uuid::parse_str(&ids1[0]).is_ok());
    }

    #[test]
    fn test_embedding_text_includes_context() {
        let source = "use std::fmt;\n\nimpl Foo {\n    fn show(&self) {}\n}\n";
        let chunks = chunker().chunk_source(source, "foo.rs", "rust");
        let text = chunks[0].embedding_text();
        assert!(text.starts_with("use std::fmt;"));
        assert!(text.contains("// In: impl Foo"));
        assert!(text.ends_with("fn show(&self) {}"));
    }

    #[test]
    fn test_context_disabled() {
        let config = ChunkingConfig {
            include_context: false,
            ..Default::default()
        };
        let chunks = CodeChunker::new(config)
            .unwrap()
            .chunk_source("import os\n\ndef main():\n    pass\n", "m.py", "python");
        assert!(chunks[0].file_context.is_empty());
    }

    #[test]
    fn test_extract_symbols() {
        let symbols = extract_symbols("func LoadUser(id int) *User { return db.Find(id) }", "go");
        assert_eq!(symbols[0], "LoadUser");
        assert!(symbols.contains(&"User".to_string()));
        assert!(symbols.contains(&"Find".to_string()));
        // Two-letter identifiers are skipped
        assert!(!symbols.contains(&"id".to_string()));
        let unique: HashSet<&String> = symbols.iter().collect();
        assert_eq!(unique.len(), symbols.len());
    }

    #[test]
    fn test_chunk_file_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.xyz");
        fs::write(&path, "hello").unwrap();
        assert!(chunker().chunk_file(&path).is_err());
    }

    #[test]
    fn test_chunk_file_with_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.rs");
        fs::write(&path, "fn test_fn() { println!(\"hello\"); }\n").unwrap();

        let chunks = chunker().chunk_file(&path).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].name, "test_fn");
        assert_eq!(chunks[0].language, "rust");
    }

    #[test]
    fn test_chunk_type_round_trip_names() {
        for ty in [
            ChunkType::Function,
            ChunkType::Method,
            ChunkType::Type,
            ChunkType::Module,
            ChunkType::Block,
        ] {
            assert_eq!(ChunkType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(ChunkType::parse("struct"), None);
    }
}
