/// Levenshtein edit distance over chars using the two-row O(min(m,n)) space
/// algorithm. Char-level rather than byte-level so umlauts and other
/// multi-byte letters count as one edit.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let a: Vec<char> = s1.chars().collect();
    let b: Vec<char> = s2.chars().collect();
    let (m, n) = (a.len(), b.len());

    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    // Keep the shorter string in the inner loop to minimise allocation.
    let (a, b, m, n) = if m <= n { (a, b, m, n) } else { (b, a, n, m) };

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity in [0.0, 1.0]: symmetric, 1.0 for identical input,
/// decreasing with edit distance relative to the longer string. Input is
/// lower-cased before comparison.
pub fn similarity(s1: &str, s2: &str) -> f64 {
    let a = s1.trim().to_lowercase();
    let b = s2.trim().to_lowercase();

    if a == b {
        return 1.0;
    }

    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }

    1.0 - (levenshtein_distance(&a, &b) as f64 / max_len as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_are_zero() {
        assert_eq!(levenshtein_distance("abc", "abc"), 0);
        assert_eq!(levenshtein_distance("", ""), 0);
    }

    #[test]
    fn empty_string_is_length_of_other() {
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("abc", ""), 3);
    }

    #[test]
    fn single_substitution() {
        assert_eq!(levenshtein_distance("cat", "bat"), 1);
    }

    #[test]
    fn umlaut_is_one_edit() {
        assert_eq!(levenshtein_distance("Bäcker", "Becker"), 1);
    }

    #[test]
    fn similarity_symmetric() {
        let pairs = [("amazon", "amzn"), ("REWE", "Rewe Markt"), ("", "x")];
        for (a, b) in pairs {
            assert_eq!(similarity(a, b).to_bits(), similarity(b, a).to_bits());
        }
    }

    #[test]
    fn similarity_identity_and_bounds() {
        for s in ["", "a", "ACME Corp", "Empfänger"] {
            assert_eq!(similarity(s, s), 1.0);
        }
        for (a, b) in [("abc", "xyz"), ("short", "a much longer string")] {
            let score = similarity(a, b);
            assert!((0.0..=1.0).contains(&score), "score was {score}");
        }
    }

    #[test]
    fn similarity_case_insensitive() {
        assert_eq!(similarity("STARBUCKS", "starbucks"), 1.0);
    }

    #[test]
    fn similarity_decreases_with_distance() {
        let near = similarity("starbucks", "starbuck");
        let far = similarity("starbucks", "whole foods");
        assert!(near > far);
        assert!(near > 0.8, "near was {near}");
    }
}
