//! Similarity scoring used to line extracted e-mail text up with the
//! platform's own record of the comment.

pub const DEFAULT_THRESHOLD: f64 = 0.8;

/// Lowercases, collapses runs of whitespace and trims.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Similarity in `[0, 1]` between two strings after normalization.
///
/// - identical → 1.0
/// - one contains the other → `len(shorter) / len(longer)`
/// - otherwise → `1 - levenshtein / max(len)`
///
/// Lengths are counted in chars.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a == b {
        return 1.0;
    }

    let len_a = a.chars().count();
    let len_b = b.chars().count();
    let (shorter, longer) = if len_a <= len_b {
        (len_a, len_b)
    } else {
        (len_b, len_a)
    };

    if a.contains(b.as_str()) || b.contains(a.as_str()) {
        return shorter as f64 / longer as f64;
    }

    let distance = strsim::levenshtein(&a, &b);
    1.0 - distance as f64 / longer as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuzzyMatch<'a, T> {
    pub item: &'a T,
    pub index: usize,
    pub score: f64,
}

/// Best candidate whose text scores at least `threshold` against `needle`.
/// Ties keep the earliest candidate. Returns `None` rather than a weak guess.
pub fn fuzzy_find_text<'a, T, F>(
    needle: &str,
    candidates: &'a [T],
    text_of: F,
    threshold: f64,
) -> Option<FuzzyMatch<'a, T>>
where
    F: Fn(&T) -> &str,
{
    let mut best: Option<FuzzyMatch<'a, T>> = None;
    for (index, item) in candidates.iter().enumerate() {
        let score = similarity(needle, text_of(item));
        if score < threshold {
            continue;
        }
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(FuzzyMatch { item, index, score });
        }
    }
    best
}
