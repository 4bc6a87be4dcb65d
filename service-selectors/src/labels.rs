//! Conversion of arbitrary selector keys to Prometheus label names.
//!
//! Prometheus label names must match `[a-zA-Z_][a-zA-Z0-9_]*`, while Kubernetes
//! selector keys may contain dots, slashes, dashes, and so on. Several keys can
//! therefore end up with the same label name: [`resolve_labels`] renames them
//! deterministically so that no selector entry is lost.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

/// Prefix of the labels that are derived from a selector key.
pub const LABEL_PREFIX: &str = "label";

/// Suffix added to the labels that collide after normalization.
pub const CONFLICT_SUFFIX: &str = "conflict";

/// Replaces every character that is not allowed in a label name by `_`.
pub fn sanitize_label_name(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Converts `camelCase` and `PascalCase` words to `snake_case`.
///
/// An underscore is inserted between a lowercase letter (or a digit) and the uppercase
/// letter that follows it, then the whole string is lowercased.
/// Like a regex replacement, matches do not overlap: `"aBC"` becomes `"a_bc"`.
pub fn to_snake_case(value: &str) -> String {
    let mut res = String::with_capacity(value.len() + 4);
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        res.push(c);
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if let Some(&next) = chars.peek() {
                if next.is_ascii_uppercase() {
                    res.push('_');
                    res.push(next);
                    chars.next();
                }
            }
        }
    }
    res.to_lowercase()
}

/// Returns the `n`-th conflicting variant of a label name.
pub fn conflict_suffix(label: &str, n: usize) -> String {
    format!("{label}_{CONFLICT_SUFFIX}{n}")
}

/// Turns an arbitrary key into a valid, snake_case label name.
///
/// If a non-empty `prefix` is given, the result is `{prefix}_{name}`.
pub fn label_name(key: &str, prefix: Option<&str>) -> String {
    let res = to_snake_case(&sanitize_label_name(key));
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}_{res}"),
        _ => res,
    }
}

/// Where a label name appeared first, and how many keys produced it.
struct Conflict {
    initial: usize,
    count: usize,
}

/// Maps a selector to Prometheus labels, returned as `(names, values)`.
///
/// The keys are processed in lexicographic order. When several keys produce the same
/// label name, every one of them gets a `_conflict{n}` suffix, numbered in key order.
/// The first one is renamed retroactively, so that no label keeps the bare name.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use service_selectors::labels::resolve_labels;
///
/// let selector = BTreeMap::from([
///     ("app.kubernetes.io/name".to_owned(), "web".to_owned()),
///     ("app_kubernetes_io_name".to_owned(), "api".to_owned()),
///     ("tier".to_owned(), "frontend".to_owned()),
/// ]);
/// let (names, values) = resolve_labels(&selector);
/// assert_eq!(
///     names,
///     vec![
///         "label_app_kubernetes_io_name_conflict1",
///         "label_app_kubernetes_io_name_conflict2",
///         "label_tier",
///     ]
/// );
/// assert_eq!(values, vec!["web", "api", "frontend"]);
/// ```
pub fn resolve_labels(selector: &BTreeMap<String, String>) -> (Vec<String>, Vec<String>) {
    let mut names: Vec<String> = Vec::with_capacity(selector.len());
    let mut values: Vec<String> = Vec::with_capacity(selector.len());
    let mut conflicts: FxHashMap<String, Conflict> = FxHashMap::default();

    // BTreeMap iterates in key order, which decides who gets `_conflict1`
    for (key, value) in selector {
        let candidate = label_name(key, Some(LABEL_PREFIX));
        let name = match conflicts.get_mut(&candidate) {
            Some(conflict) => {
                if conflict.count == 1 {
                    names[conflict.initial] = conflict_suffix(&candidate, 1);
                }
                conflict.count += 1;
                conflict_suffix(&candidate, conflict.count)
            }
            None => {
                conflicts.insert(
                    candidate.clone(),
                    Conflict {
                        initial: names.len(),
                        count: 1,
                    },
                );
                candidate
            }
        };
        names.push(name);
        values.push(value.to_owned());
    }
    (names, values)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn selector(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_sanitize_label_name() {
        for value in ["test_string", "test\\string", "test!string", "test string", "test.string"] {
            assert_eq!(sanitize_label_name(value), "test_string", "input: {value:?}");
        }
        assert_eq!(sanitize_label_name(""), "");
        assert_eq!(sanitize_label_name("app.kubernetes.io/name"), "app_kubernetes_io_name");
        // one character, one underscore, even outside of ASCII
        assert_eq!(sanitize_label_name("clé"), "cl_");
    }

    #[test]
    fn test_to_snake_case() {
        for value in ["testString", "TestString", "Test_string", "test_String"] {
            assert_eq!(to_snake_case(value), "test_string", "input: {value:?}");
        }
        assert_eq!(to_snake_case("aBC"), "a_bc");
        assert_eq!(to_snake_case("version2Beta"), "version2_beta");
        assert_eq!(to_snake_case("HTTPServer"), "httpserver");
        assert_eq!(to_snake_case(""), "");
    }

    #[test]
    fn test_label_name() {
        assert_eq!(label_name("TestString", None), "test_string");
        assert_eq!(label_name("TestString", Some("some")), "some_test_string");
        assert_eq!(label_name("app.kubernetes.io/managedBy", Some("label")), "label_app_kubernetes_io_managed_by");
        assert_eq!(label_name("", None), "");
        assert_eq!(label_name("", Some("label")), "label_");
        assert_eq!(label_name("Key", Some("")), "key");
    }

    #[test]
    fn test_label_name_idempotent() {
        for value in ["test_string", "TestString", "a.b/c-d", "camelCase42Words", "aBC", "x"] {
            let once = label_name(value, None);
            assert_eq!(label_name(&once, None), once, "input: {value:?}");
        }
    }

    #[test]
    fn test_conflict_suffix() {
        for i in 0..10 {
            assert_eq!(conflict_suffix("test_string", i), format!("test_string_conflict{i}"));
        }
    }

    #[test]
    fn test_resolve_empty() {
        let (names, values) = resolve_labels(&BTreeMap::new());
        assert!(names.is_empty());
        assert!(values.is_empty());
    }

    #[test]
    fn test_resolve_no_conflicts() {
        let labels = selector(&[("key_3", "value_3"), ("key_1", "value_1"), ("key_2", "value_2")]);
        let (names, values) = resolve_labels(&labels);
        assert_eq!(names, vec!["label_key_1", "label_key_2", "label_key_3"]);
        assert_eq!(values, vec!["value_1", "value_2", "value_3"]);
    }

    #[test]
    fn test_resolve_conflicts() {
        let labels = selector(&[
            ("key_1", "value_4"),
            ("key.1", "value_2"),
            ("key/1", "value_3"),
            ("Key_1", "value_1"),
        ]);
        let (names, values) = resolve_labels(&labels);
        assert_eq!(
            names,
            vec![
                "label_key_1_conflict1",
                "label_key_1_conflict2",
                "label_key_1_conflict3",
                "label_key_1_conflict4",
            ]
        );
        assert_eq!(values, vec!["value_1", "value_2", "value_3", "value_4"]);
    }

    #[test]
    fn test_resolve_conflicts_mixed_with_unique_keys() {
        let labels = selector(&[
            ("app", "web"),
            ("role.tier", "a"),
            ("zone", "eu"),
            ("role/tier", "b"),
        ]);
        let (names, values) = resolve_labels(&labels);
        // the first occurrence keeps its position, only its name changes
        assert_eq!(
            names,
            vec![
                "label_app",
                "label_role_tier_conflict1",
                "label_role_tier_conflict2",
                "label_zone",
            ]
        );
        assert_eq!(values, vec!["web", "a", "b", "eu"]);
    }

    #[test]
    fn test_resolve_key_shaped_like_a_conflict() {
        // a key that normalizes to an already suffixed name is not renamed
        let labels = selector(&[("A", "1"), ("a", "2"), ("a_conflict1", "3")]);
        let (names, values) = resolve_labels(&labels);
        assert_eq!(
            names,
            vec!["label_a_conflict1", "label_a_conflict2", "label_a_conflict1"]
        );
        assert_eq!(values, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_resolve_values_verbatim() {
        let labels = selector(&[("app", "Some Value/with.chars!")]);
        let (_, values) = resolve_labels(&labels);
        assert_eq!(values, vec!["Some Value/with.chars!"]);
    }
}
