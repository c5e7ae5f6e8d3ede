//! Property-based tests for key pattern matching

use proptest::prelude::*;
use translib_db::{glob_match, Key};

/// Key components without glob metacharacters
fn literal_comp_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z0-9:./-]{0,12}"
}

fn literal_key_strategy() -> impl Strategy<Value = Key> {
    proptest::collection::vec(literal_comp_strategy(), 1..4).prop_map(Key::new)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn literal_key_matches_itself(key in literal_key_strategy()) {
        prop_assert!(!key.is_pattern());
        prop_assert!(key.matches(&key));
    }

    #[test]
    fn all_wildcard_pattern_matches_same_arity(key in literal_key_strategy()) {
        let pattern = Key::new(key.comps.iter().map(|_| "*"));
        prop_assert!(pattern.is_pattern());
        prop_assert!(key.matches(&pattern));
    }

    #[test]
    fn arity_mismatch_never_matches(key in literal_key_strategy()) {
        let mut longer = key.comps.clone();
        longer.push("*".to_string());
        prop_assert!(!key.matches(&Key::new(longer)));
    }

    #[test]
    fn prefix_star_matches_extensions(prefix in literal_comp_strategy(), suffix in literal_comp_strategy()) {
        let pattern = format!("{}*", prefix);
        let value = format!("{}{}", prefix, suffix);
        prop_assert!(glob_match(&pattern, &value));
    }

    #[test]
    fn question_mark_matches_exactly_one_char(value in "[a-z]{0,6}") {
        let pattern = "?".repeat(value.len());
        prop_assert!(glob_match(&pattern, &value));
        let longer = format!("{}?", pattern);
        prop_assert!(!glob_match(&longer, &value));
    }
}
