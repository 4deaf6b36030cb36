//! Search budget sizing.

#![forbid(unsafe_code)]

pub const MIN_BUDGET: usize = 8;
pub const MAX_BUDGET: usize = 30;
const ENTRIES_PER_SEARCH: usize = 4;
const CHARS_PER_SEARCH: usize = 600;

/// `clamp(ceil(count / 4) + ceil(total_chars / 600), 8, 30)` over the queued texts.
pub fn compute_budget<'a>(texts: impl IntoIterator<Item = &'a str>) -> usize {
    let (count, chars) = texts
        .into_iter()
        .fold((0usize, 0usize), |(n, c), t| (n + 1, c + t.chars().count()));
    let raw = count.div_ceil(ENTRIES_PER_SEARCH) + chars.div_ceil(CHARS_PER_SEARCH);
    raw.clamp(MIN_BUDGET, MAX_BUDGET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_batches_get_the_floor() {
        assert_eq!(compute_budget(Vec::<&str>::new()), MIN_BUDGET);
        assert_eq!(compute_budget(["Sword", "Shield"]), MIN_BUDGET);
    }

    #[test]
    fn grows_with_count_and_length() {
        // 40 entries -> 10, 40 * 20 chars = 800 -> 2
        let texts: Vec<String> = (0..40).map(|_| "x".repeat(20)).collect();
        assert_eq!(compute_budget(texts.iter().map(|s| s.as_str())), 12);
    }

    #[test]
    fn capped_at_ceiling() {
        let long = "字".repeat(10_000);
        assert_eq!(compute_budget([long.as_str()]), MAX_BUDGET);
    }
}
