//! Text similarity used by the fusion matcher.

/// Normalize for comparison: lowercase, strip non-alphanumerics, collapse
/// whitespace.
pub fn normalize_text(text: &str) -> String {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Character-level similarity: longest-common-subsequence ratio,
/// `2 * lcs / (len1 + len2)`.
pub fn lcs_ratio(a: &str, b: &str) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    let mut previous = vec![0usize; b_chars.len() + 1];
    let mut current = vec![0usize; b_chars.len() + 1];
    for &ca in &a_chars {
        for (j, &cb) in b_chars.iter().enumerate() {
            current[j + 1] = if ca == cb {
                previous[j] + 1
            } else {
                previous[j + 1].max(current[j])
            };
        }
        std::mem::swap(&mut previous, &mut current);
        current.fill(0);
    }
    let lcs = previous[b_chars.len()];
    (2 * lcs) as f32 / (a_chars.len() + b_chars.len()) as f32
}

/// Character-level similarity: the better of LCS ratio and normalized
/// Levenshtein. Product titles are long enough that either works; taking the
/// max tolerates truncation on one side.
pub fn char_similarity(a: &str, b: &str) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    lcs_ratio(a, b).max(strsim::normalized_levenshtein(a, b) as f32)
}

/// Token-level Jaccard similarity over tokens of length >= 3. Often better
/// than character similarity for titles where word order varies.
pub fn word_overlap(a: &str, b: &str) -> f32 {
    let words_a: std::collections::HashSet<&str> =
        a.split_whitespace().filter(|w| w.len() >= 3).collect();
    let words_b: std::collections::HashSet<&str> =
        b.split_whitespace().filter(|w| w.len() >= 3).collect();

    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    intersection as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_punctuation() {
        assert_eq!(
            normalize_text("ASUS TUF Gaming A16 (2024) - RTX™ 4060!"),
            "asus tuf gaming a16 2024 rtx 4060"
        );
    }

    #[test]
    fn test_lcs_ratio_identical_and_disjoint() {
        assert!((lcs_ratio("laptop", "laptop") - 1.0).abs() < 1e-6);
        assert_eq!(lcs_ratio("abc", ""), 0.0);
        assert!(lcs_ratio("aaaa", "bbbb") < 0.01);
    }

    #[test]
    fn test_word_overlap_order_insensitive() {
        let a = normalize_text("RTX 4060 Gaming Laptop Acer Nitro");
        let b = normalize_text("Acer Nitro Gaming Laptop RTX 4060");
        assert!((word_overlap(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_word_overlap_filters_short_tokens() {
        // "a" and "of" never count toward similarity.
        assert_eq!(word_overlap("a of", "a of"), 0.0);
    }

    #[test]
    fn test_similar_titles_score_above_threshold() {
        let vision = normalize_text("Acer Nitro V 16 Gaming Laptop GeForce RTX 4060");
        let link = normalize_text("Acer - Nitro V 16 Gaming Laptop - NVIDIA GeForce RTX 4060 - Black");
        let score = char_similarity(&vision, &link).max(word_overlap(&vision, &link));
        assert!(score >= 0.40, "score was {score}");
    }
}
