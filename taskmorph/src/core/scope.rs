//! Goal normalisation and word scope.
//!
//! A goal's scope is the set of lowercase words it mentions, where a word is
//! a run of letters and digits in any script.
//! Scope comparisons back the monotonic-decomposition check.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{M}\p{N}]+").expect("word pattern is valid"));

/// Lowercase the goal and collapse it to single-space separated words.
pub fn normalize(goal: &str) -> String {
    words(goal).collect::<Vec<_>>().join(" ")
}

/// The set of distinct words in a goal.
pub fn scope(goal: &str) -> BTreeSet<String> {
    words(goal).collect()
}

/// True if `child` covers everything `parent` does (including equality).
pub fn is_superset(child: &str, parent: &str) -> bool {
    scope(child).is_superset(&scope(parent))
}

fn words(goal: &str) -> impl Iterator<Item = String> {
    let lowered = goal.to_lowercase();
    WORD_RE
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect::<Vec<_>>()
        .into_iter()
}
