// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Request-bound validation (§6, §7). The HTTP shell that decodes query
//! strings and JSON bodies is out of scope for this crate; these are the
//! pure checks it would call before handing a node list or time span to the
//! [`crate::engine::Engine`].

use crate::error::ValidationError;
use crate::timestamp::Timestamp;

/// Splits a comma-separated node-list parameter and checks it against the
/// bounds in §6: at most `max_len` characters, at most `max_entries`
/// comma-separated tokens, each token matching `[A-Za-z0-9_ -]+`.
pub fn validate_node_list(raw: &str, max_len: usize, max_entries: usize) -> Result<Vec<String>, ValidationError> {
    if raw.len() > max_len {
        return Err(ValidationError::NodeListTooLong { max: max_len, actual: raw.len() });
    }
    let tokens: Vec<String> = raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    if tokens.len() > max_entries {
        return Err(ValidationError::TooManyNodes { max: max_entries, actual: tokens.len() });
    }
    for token in &tokens {
        if !token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ' || c == '-')
        {
            return Err(ValidationError::InvalidNodeToken(token.clone()));
        }
    }
    Ok(tokens)
}

/// Rejects a timeline request spanning more than `max_days` (§6 "max span 3
/// days"). `start`/`end` order is not this function's concern — a caller
/// handing in a reversed span still gets the same day-count check.
pub fn validate_span(start: Timestamp, end: Timestamp, max_days: i64) -> Result<(), ValidationError> {
    let span = (end.as_datetime() - start.as_datetime()).num_seconds().abs();
    let actual_days = span / 86_400;
    if actual_days > max_days {
        return Err(ValidationError::SpanTooLong { max_days, actual_days });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn accepts_well_formed_node_list() {
        let tokens = validate_node_list("node-a, node-b, test_c", 250, 60).unwrap();
        assert_eq!(tokens, vec!["node-a", "node-b", "test_c"]);
    }

    #[test]
    fn rejects_oversize_node_list() {
        let raw = "a".repeat(300);
        assert!(matches!(
            validate_node_list(&raw, 250, 60),
            Err(ValidationError::NodeListTooLong { .. })
        ));
    }

    #[test]
    fn rejects_too_many_entries() {
        let raw = (0..61).map(|i| format!("n{i}")).collect::<Vec<_>>().join(",");
        assert!(matches!(
            validate_node_list(&raw, 1500, 60),
            Err(ValidationError::TooManyNodes { .. })
        ));
    }

    #[test]
    fn rejects_illegal_characters() {
        assert!(matches!(
            validate_node_list("node-a;drop table", 250, 60),
            Err(ValidationError::InvalidNodeToken(_))
        ));
    }

    #[test]
    fn accepts_span_within_three_days() {
        let start = Timestamp::now();
        let end = start + Duration::from_secs(3 * 24 * 3600);
        assert!(validate_span(start, end, 3).is_ok());
    }

    #[test]
    fn rejects_span_over_three_days() {
        let start = Timestamp::now();
        let end = start + Duration::from_secs(4 * 24 * 3600);
        assert!(matches!(validate_span(start, end, 3), Err(ValidationError::SpanTooLong { .. })));
    }
}
