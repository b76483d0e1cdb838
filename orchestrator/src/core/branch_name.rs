//! Deterministic branch naming for working and backup branches.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum length of the slug part of a working branch name.
pub const MAX_SLUG_LEN: usize = 50;

/// Highest numeric suffix tried before giving up on disambiguation.
pub const MAX_SUFFIX: u32 = 999;

static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^a-z0-9]+").expect("slug regex is valid"));

/// Lowercase `title`, collapse everything outside `[a-z0-9]` into single
/// dashes, trim dashes, and cap the result at [`MAX_SLUG_LEN`].
pub fn slugify(title: &str) -> String {
    let lowered = title.to_lowercase();
    let dashed = NON_SLUG.replace_all(&lowered, "-");
    let trimmed = dashed.trim_matches('-');
    let capped: String = trimmed.chars().take(MAX_SLUG_LEN).collect();
    let slug = capped.trim_end_matches('-');
    if slug.is_empty() {
        "item".to_string()
    } else {
        slug.to_string()
    }
}

/// Generate `<prefix><slug>`, appending `-2`, `-3`, ... while `exists` reports
/// a collision. Same title and same existing set always yield the same name.
///
/// Returns `None` only when every suffix up to [`MAX_SUFFIX`] is taken.
pub fn generate_branch_name(
    prefix: &str,
    title: &str,
    exists: impl Fn(&str) -> bool,
) -> Option<String> {
    disambiguate(&format!("{prefix}{}", slugify(title)), exists)
}

/// Append the first free numeric suffix to `base` (or return `base` as is).
pub fn disambiguate(base: &str, exists: impl Fn(&str) -> bool) -> Option<String> {
    if !exists(base) {
        return Some(base.to_string());
    }
    (2..=MAX_SUFFIX)
        .map(|suffix| format!("{base}-{suffix}"))
        .find(|candidate| !exists(candidate))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn slugify_collapses_symbols() {
        assert_eq!(slugify("  Fix: N+1 queries in /api/users!! "), "fix-n-1-queries-in-api-users");
    }

    #[test]
    fn slugify_caps_length_without_trailing_dash() {
        let title = format!("{} tail", "a".repeat(49));
        let slug = slugify(&title);
        assert_eq!(slug, "a".repeat(49));
        assert!(slug.len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn slugify_falls_back_for_symbol_only_titles() {
        assert_eq!(slugify("!!!"), "item");
    }

    #[test]
    fn same_title_same_name() {
        let none = |_: &str| false;
        assert_eq!(
            generate_branch_name("mason/", "Add retries", none),
            generate_branch_name("mason/", "Add retries", none)
        );
        assert_eq!(
            generate_branch_name("mason/", "Add retries", none).as_deref(),
            Some("mason/add-retries")
        );
    }

    #[test]
    fn collisions_get_suffixes() {
        let taken: HashSet<&str> = ["mason/add-retries", "mason/add-retries-2"].into();
        let name = generate_branch_name("mason/", "Add retries", |n| taken.contains(n));
        assert_eq!(name.as_deref(), Some("mason/add-retries-3"));
    }

    #[test]
    fn exhausted_suffixes_return_none() {
        assert_eq!(disambiguate("b", |_| true), None);
    }
}
