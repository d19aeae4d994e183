//! Pure regex-based ticket extraction. No I/O: the extractor
//! is built once and reused across calls, matching the one-client-per-run
//! style the adapters use for their `reqwest::Client`.

use regex::Regex;
use std::collections::BTreeSet;

pub struct JiraExtractor {
    pattern: Regex,
}

impl JiraExtractor {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(r"\b([A-Z][A-Z0-9]+-\d+)\b").expect("jira ticket regex is valid"),
        }
    }

    /// Extracts the set of ticket ids mentioned across all given strings,
    /// deduplicated. Idempotent: `extract(extract(s))` yields the same set.
    pub fn extract(&self, texts: &[&str]) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        for text in texts {
            for m in self.pattern.find_iter(text) {
                found.insert(m.as_str().to_string());
            }
        }
        found
    }

    /// Bitbucket additionally exposes `properties.jira-key`; union both
    /// sources, deduplicating by ticket id.
    pub fn extract_with_properties(&self, texts: &[&str], property_keys: &[&str]) -> BTreeSet<String> {
        let mut found = self.extract(texts);
        for key in property_keys {
            found.insert(key.to_string());
        }
        found
    }
}

impl Default for JiraExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_a_simple_ticket_id() {
        let extractor = JiraExtractor::new();
        let found = extractor.extract(&["PLTFRM-84867 feat: cli"]);
        assert_eq!(found.len(), 1);
        assert!(found.contains("PLTFRM-84867"));
    }

    #[test]
    fn extracts_multiple_distinct_tickets_across_fields() {
        let extractor = JiraExtractor::new();
        let found = extractor.extract(&["fixes ABC-1 and ABC-2", "see also XYZ-99"]);
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn deduplicates_repeated_mentions() {
        let extractor = JiraExtractor::new();
        let found = extractor.extract(&["ABC-1 ABC-1 ABC-1"]);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn requires_leading_uppercase_letter_and_word_boundary() {
        let extractor = JiraExtractor::new();
        // lowercase prefix, embedded digits-only prefix, no trailing digits
        let found = extractor.extract(&["abc-1 9AB-2 FOO-"]);
        assert!(found.is_empty());
    }

    #[test]
    fn extraction_is_idempotent_as_a_set() {
        let extractor = JiraExtractor::new();
        let text = "PLTFRM-84867 and ABC-2";
        let first: BTreeSet<String> = extractor.extract(&[text]);
        let joined: Vec<&str> = first.iter().map(|s| s.as_str()).collect();
        let second = extractor.extract(&joined);
        assert_eq!(first, second);
    }

    #[test]
    fn unions_regex_matches_with_bitbucket_jira_key_property() {
        let extractor = JiraExtractor::new();
        let found = extractor.extract_with_properties(&["mentions ABC-1"], &["ABC-1", "ABC-2"]);
        assert_eq!(found.len(), 2);
    }
}
