//! Identifier-aware tokenisation shared by the keyword index, the hash
//! embedder and query expansion.

/// Split an identifier into lowercase parts on `_`, `-`, `.` and
/// lower-to-upper case transitions.
///
/// `getUserName` gives `get user name`, `HTTPServer` stays one part.
pub fn identifier_parts(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for segment in word
        .split(|c: char| c == '_' || c == '-' || c == '.')
        .filter(|s| !s.is_empty())
    {
        let mut current = String::new();
        let mut prev_lower = false;
        for ch in segment.chars() {
            if ch.is_uppercase() && prev_lower && !current.is_empty() {
                parts.push(current.to_lowercase());
                current.clear();
            }
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
            current.push(ch);
        }
        if !current.is_empty() {
            parts.push(current.to_lowercase());
        }
    }
    parts
}

/// Lowercased words of `text`. Compound identifiers contribute their parts
/// followed by the whole word.
pub fn code_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
    {
        let parts = identifier_parts(word);
        if parts.len() > 1 {
            tokens.extend(parts);
        }
        tokens.push(word.to_lowercase());
    }
    tokens
}

/// Levenshtein distance, giving up once it exceeds `max`.
pub fn edit_distance_within(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return None;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        let mut row_min = curr[0];
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
            row_min = row_min.min(curr[j]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let distance = prev[b.len()];
    (distance <= max).then_some(distance)
}
