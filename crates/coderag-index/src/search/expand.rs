//! Query expansion for the semantic path.
//!
//! Identifiers are split into their words and respelled, words from a
//! curated synonym group pull in the rest of the group, and language
//! mentions add the vocabulary that language's code uses.

use std::collections::HashSet;

use crate::tokens::identifier_parts;

const SYNONYM_GROUPS: &[&[&str]] = &[
    // authentication and users
    &[
        "auth", "authentication", "authorization", "login", "signin", "signup", "register",
        "registration", "logout", "signout", "session", "jwt", "token", "oauth", "credentials",
        "password",
    ],
    &["user", "account", "profile", "member", "customer", "person", "identity", "principal"],
    // crud
    &["create", "add", "new", "insert", "post", "save", "store", "register", "make", "build"],
    &["read", "get", "fetch", "retrieve", "find", "search", "query", "list", "show", "view"],
    &["update", "edit", "modify", "patch", "put", "change", "alter", "revise", "set"],
    &["delete", "remove", "destroy", "drop", "purge", "clear", "erase", "trash"],
    // web
    &[
        "websocket", "ws", "socket", "realtime", "real-time", "streaming", "stream", "connection",
        "push",
    ],
    &["api", "endpoint", "rest", "graphql", "route", "path", "resource", "service"],
    &["handler", "controller", "processor", "listener", "callback", "responder"],
    &["middleware", "interceptor", "filter", "hook", "plugin", "guard", "decorator"],
    &["request", "req", "input", "payload", "body", "params", "query"],
    &["response", "res", "resp", "output", "result", "reply", "answer"],
    // storage
    &[
        "db", "database", "sql", "postgres", "postgresql", "mysql", "mongo", "mongodb", "redis",
        "store", "repository", "repo",
    ],
    &["model", "schema", "entity", "table", "collection", "document", "record"],
    &["migration", "migrate", "upgrade", "seed", "initialize"],
    // errors
    &["error", "err", "exception", "panic", "failure", "fault", "catch", "throw", "reject"],
    &["validate", "validation", "verify", "check", "ensure", "assert", "confirm"],
    &[
        "test", "spec", "testing", "unittest", "unit-test", "integration", "e2e", "mock", "stub",
        "spy", "fixture",
    ],
    &["config", "configuration", "settings", "env", "environment", "options", "preferences", "setup"],
    &["cache", "caching", "redis", "memcached", "memory", "buffer", "store"],
    // messaging
    &["message", "msg", "event", "notification", "alert", "email", "sms", "push"],
    &["queue", "mq", "rabbitmq", "kafka", "pubsub", "publish", "subscribe", "broker"],
    // language constructs
    &["function", "func", "method", "procedure", "routine", "operation"],
    &["class", "struct", "type", "interface", "trait", "protocol"],
    &["import", "require", "include", "use", "dependency"],
    &["export", "expose", "public", "api"],
    &["init", "initialize", "setup", "bootstrap", "start", "begin", "constructor", "new"],
    &["close", "shutdown", "cleanup", "dispose", "teardown", "stop", "end", "destructor"],
    &["handler", "controller", "endpoint", "route", "view", "action", "processor", "listener"],
    &["async", "await", "promise", "callback", "then", "asynchronous", "concurrent", "parallel"],
    &["sync", "synchronous", "blocking", "sequential"],
    &["connect", "connection", "connected", "disconnect", "disconnected", "reconnect"],
    &["subscribe", "subscription", "unsubscribe", "publish", "publisher", "subscriber"],
    &["emit", "event", "trigger", "fire", "dispatch", "broadcast"],
    &["transform", "convert", "parse", "serialize", "deserialize", "encode", "decode"],
    &["validate", "validator", "validation", "verify", "check", "ensure", "assert"],
    &["filter", "map", "reduce", "aggregate", "collect", "group", "sort"],
    &["push", "pop", "enqueue", "dequeue", "peek", "shift", "unshift"],
    &["lock", "unlock", "mutex", "semaphore", "atomic", "synchronized"],
    &["begin", "commit", "rollback", "transaction", "savepoint"],
];

/// Component words and alternate spellings of every compound identifier
/// in `query`.
pub fn expand_identifiers(query: &str) -> Vec<String> {
    let mut extra = Vec::new();
    for word in query.split_whitespace() {
        let parts = identifier_parts(word);
        if parts.len() < 2 {
            continue;
        }
        extra.extend(parts.iter().cloned());
        extra.push(parts.join("_"));
        let camel: String = parts
            .iter()
            .enumerate()
            .map(|(i, p)| if i == 0 { p.clone() } else { capitalize(p) })
            .collect();
        extra.push(camel);
    }
    extra
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Expand `query` with identifier parts, synonyms and language hints.
/// The original query text always comes first.
pub fn expand_query(query: &str) -> String {
    let mut expanded = query.to_string();
    let identifier_terms = expand_identifiers(query);
    for term in &identifier_terms {
        expanded.push(' ');
        expanded.push_str(term);
    }

    let lower = expanded.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    let present: HashSet<&str> = words.iter().copied().collect();
    let mut added: HashSet<&str> = HashSet::new();

    for word in &words {
        for group in SYNONYM_GROUPS.iter().filter(|g| g.contains(word)) {
            for synonym in group.iter() {
                if !present.contains(synonym) && added.insert(*synonym) {
                    expanded.push(' ');
                    expanded.push_str(synonym);
                }
            }
        }
    }

    let bare: HashSet<String> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    if bare.contains("go") || bare.contains("golang") {
        expanded.push_str(" golang go func");
    }
    if bare.contains("js") || bare.contains("javascript") {
        expanded.push_str(" javascript js node async await");
    }
    if lower.contains("react") {
        expanded.push_str(" component jsx tsx hooks");
    }

    expanded
}
