//! Status vocabulary shared by local and remote representations.
//!
//! Trackers disagree on status names (`open`, `closed`, `in_progress`,
//! `wip`, ...). Both sides are mapped onto one canonical set before
//! comparison so that a rename on one side is not reported as an edit.
//! Three-tier resolution: exact match → synonym lookup → error with
//! suggestion.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

// ── Valid value sets (O(1) lookups) ──────────────────────────

pub static VALID_STATUSES: LazyLock<HashSet<&str>> = LazyLock::new(|| {
    ["backlog", "todo", "in-progress", "blocked", "review", "done"]
        .into_iter()
        .collect()
});

// ── Synonym maps ─────────────────────────────────────────────

pub static STATUS_SYNONYMS: LazyLock<HashMap<&str, &str>> = LazyLock::new(|| {
    [
        ("open", "todo"),
        ("opened", "todo"),
        ("new", "todo"),
        ("pending", "todo"),
        ("to-do", "todo"),
        ("to_do", "todo"),
        ("in_progress", "in-progress"),
        ("in progress", "in-progress"),
        ("inprogress", "in-progress"),
        ("wip", "in-progress"),
        ("started", "in-progress"),
        ("active", "in-progress"),
        ("doing", "in-progress"),
        ("waiting", "blocked"),
        ("on-hold", "blocked"),
        ("in-review", "review"),
        ("in_review", "review"),
        ("reviewing", "review"),
        ("closed", "done"),
        ("complete", "done"),
        ("completed", "done"),
        ("finished", "done"),
        ("resolved", "done"),
        ("deferred", "backlog"),
        ("later", "backlog"),
        ("icebox", "backlog"),
    ]
    .into_iter()
    .collect()
});

/// Normalize a status string via exact match or synonym lookup.
///
/// Returns the canonical status, or an error with the original input
/// and an optional suggestion.
pub fn normalize_status(input: &str) -> Result<String, (String, Option<String>)> {
    let lower = input.trim().to_lowercase();

    // Tier 1: exact match
    if VALID_STATUSES.contains(lower.as_str()) {
        return Ok(lower);
    }

    // Tier 2: synonym lookup
    if let Some(&canonical) = STATUS_SYNONYMS.get(lower.as_str()) {
        return Ok(canonical.to_string());
    }

    // Tier 3: find closest suggestion
    let suggestion = find_closest_match(&lower, &VALID_STATUSES, &STATUS_SYNONYMS);
    Err((input.to_string(), suggestion))
}

/// Total variant of [`normalize_status`] for comparison use.
///
/// Unknown statuses are kept (trimmed, lowercased) so that two sides using
/// the same unknown value still compare equal.
#[must_use]
pub fn canonical_status(input: &str) -> String {
    normalize_status(input).unwrap_or_else(|_| input.trim().to_lowercase())
}

/// Find the closest matching value across valid set and synonyms.
fn find_closest_match(
    input: &str,
    valid: &HashSet<&str>,
    synonyms: &HashMap<&str, &str>,
) -> Option<String> {
    let mut best: Option<(&str, usize)> = None;

    for &v in valid.iter().chain(synonyms.keys()) {
        let dist = levenshtein_distance(input, v);
        if dist <= 3 && best.is_none_or(|(_, best_dist)| dist < best_dist) {
            // For synonyms, show what it maps to
            let shown = synonyms.get(v).copied().unwrap_or(v);
            best = Some((shown, dist));
        }
    }

    best.map(|(v, _)| v.to_string())
}

// ── Levenshtein distance ─────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let a_len = a.len();
    let b_len = b.len();

    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    // Use single-row optimization (O(min(m,n)) space)
    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for i in 1..=a_len {
        curr[0] = i;
        for j in 1..=b_len {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1) // deletion
                .min(curr[j - 1] + 1) // insertion
                .min(prev[j - 1] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_len]
}
