//! Path and topic matching.
//!
//! Two mechanisms live here: the pattern match used by subscriptions and
//! interceptors (exact, or trailing-`*` prefix, nothing fancier), and the
//! segment-wise similarity score used for approximate endpoint resolution.

/// Does `pattern` select `value`?
///
/// A pattern matches if the strings are equal, or if the pattern ends with
/// `*` and `value` starts with the pattern's prefix.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Similarity of two paths in `[0.0, 1.0]`.
///
/// Paths are split on `/`; each segment pair contributes `1.0` on an exact
/// match and `1 - edit_distance / max_len` otherwise. Segments present in
/// only one path contribute `0.0`. The score is the mean over the longer
/// segment count.
pub fn path_similarity(a: &str, b: &str) -> f64 {
    let a_segs = segments(a);
    let b_segs = segments(b);
    let count = a_segs.len().max(b_segs.len());
    if count == 0 {
        return 1.0;
    }

    let mut total = 0.0;
    for i in 0..count {
        match (a_segs.get(i), b_segs.get(i)) {
            (Some(x), Some(y)) if x == y => total += 1.0,
            (Some(x), Some(y)) => {
                let max_len = x.len().max(y.len());
                total += 1.0 - strsim::levenshtein(x, y) as f64 / max_len as f64;
            }
            _ => {}
        }
    }
    total / count as f64
}

/// The best-scoring candidate at or above `threshold`, with its score.
///
/// Ties break by lexical order of the candidate path so resolution is
/// deterministic.
pub fn best_match<'a, I>(target: &str, candidates: I, threshold: f64) -> Option<(&'a str, f64)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(&'a str, f64)> = None;
    for candidate in candidates {
        let score = path_similarity(target, candidate);
        if score < threshold {
            continue;
        }
        best = match best {
            Some((prev, prev_score))
                if score < prev_score || (score == prev_score && prev < candidate) =>
            {
                Some((prev, prev_score))
            }
            _ => Some((candidate, score)),
        };
    }
    best
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_prefix_patterns() {
        assert!(pattern_matches("/search/files", "/search/files"));
        assert!(!pattern_matches("/search/files", "/search/web"));
        assert!(pattern_matches("/search/*", "/search/files"));
        assert!(pattern_matches("/search/*", "/search/"));
        assert!(!pattern_matches("/search/*", "/searching"));
        assert!(pattern_matches("*", "/anything/at/all"));
    }

    #[test]
    fn star_only_matches_as_suffix() {
        // No globbing in the middle: the `*` is literal unless trailing.
        assert!(!pattern_matches("/a/*/c", "/a/b/c"));
    }

    #[test]
    fn identical_paths_score_one() {
        assert_eq!(path_similarity("/products/search", "/products/search"), 1.0);
    }

    #[test]
    fn near_miss_scores_above_distant_path() {
        let close = path_similarity("/product/search", "/products/search");
        let far = path_similarity("/product/search", "/items/search");
        assert!(close > far);
        assert!(close >= 0.8, "got {close}");
        assert!(far < 0.8, "got {far}");
    }

    #[test]
    fn missing_segments_count_against_the_score() {
        let score = path_similarity("/a/b", "/a/b/c");
        assert!(score < 1.0);
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn best_match_breaks_ties_lexically() {
        // Both candidates score the same against the target.
        let got = best_match("/c/x", ["/b/x", "/a/x"], 0.5);
        assert_eq!(got, Some(("/a/x", 0.5)));
    }

    #[test]
    fn threshold_is_inclusive() {
        // Segment scores 1.0 and 0.5 average to exactly 0.75.
        let score = path_similarity("/api/ab", "/api/cb");
        assert_eq!(score, 0.75);
        assert!(best_match("/api/ab", ["/api/cb"], 0.75).is_some());
        assert!(best_match("/api/ab", ["/api/cb"], 0.76).is_none());
    }
}
