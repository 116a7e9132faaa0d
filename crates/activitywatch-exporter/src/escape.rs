// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Escaping of free text embedded in line protocol records.

/// Longest tag value, in code points, written to a record.
pub const TAG_VALUE_LIMIT: usize = 1024;

const ELLIPSIS: &str = "...";

/// Escapes a tag value for the line protocol and clamps it to [`TAG_VALUE_LIMIT`] code points.
///
/// Commas are escaped first, then equals signs, then spaces. Values longer than
/// the limit after escaping are cut to `TAG_VALUE_LIMIT - 3` code points followed
/// by `...`.
///
/// ```
/// use activitywatch_exporter::escape::escape_tag_value;
///
/// assert_eq!(escape_tag_value("a b,c=d"), r"a\ b\,c\=d");
/// ```
pub fn escape_tag_value(value: &str) -> String {
    let escaped = value
        .replace(',', r"\,")
        .replace('=', r"\=")
        .replace(' ', r"\ ");

    match escaped.char_indices().nth(TAG_VALUE_LIMIT) {
        None => escaped,
        Some(_) => {
            let keep = TAG_VALUE_LIMIT - ELLIPSIS.len();
            let mut clamped: String = escaped.chars().take(keep).collect();
            clamped.push_str(ELLIPSIS);
            clamped
        }
    }
}

/// Escapes the content of a double-quoted string field value.
pub fn escape_field_string(value: &str) -> String {
    value.replace('\\', r"\\").replace('"', r#"\""#)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Splits on delimiters that aren't preceded by a backslash and unescapes each part.
    fn split_unescaped(escaped: &str, delimiter: char) -> Vec<String> {
        let mut parts = vec![String::new()];
        let mut chars = escaped.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some(next @ (',' | '=' | ' ')) => parts.last_mut().unwrap().push(next),
                    Some(next) => {
                        let part = parts.last_mut().unwrap();
                        part.push('\\');
                        part.push(next);
                    }
                    None => parts.last_mut().unwrap().push('\\'),
                }
            } else if c == delimiter {
                parts.push(String::new());
            } else {
                parts.last_mut().unwrap().push(c);
            }
        }
        parts
    }

    #[test]
    fn test_escape_order() {
        assert_eq!(escape_tag_value("k=v, x"), r"k\=v\,\ x");
        assert_eq!(escape_tag_value("plain"), "plain");
        assert_eq!(escape_tag_value(""), "");
    }

    #[test]
    fn test_value_at_limit_is_untouched() {
        let value = "a".repeat(TAG_VALUE_LIMIT);
        assert_eq!(escape_tag_value(&value), value);
    }

    #[test]
    fn test_long_value_is_clamped() {
        let escaped = escape_tag_value(&"a".repeat(TAG_VALUE_LIMIT + 1));
        assert_eq!(escaped.chars().count(), TAG_VALUE_LIMIT);
        assert!(escaped.ends_with("..."));
        assert!(escaped.starts_with(&"a".repeat(TAG_VALUE_LIMIT - 3)));
    }

    #[test]
    fn test_limit_counts_code_points_not_bytes() {
        // 600 code points, 1800 bytes.
        let value = "€".repeat(600);
        assert_eq!(escape_tag_value(&value), value);

        let clamped = escape_tag_value(&"€".repeat(2000));
        assert_eq!(clamped.chars().count(), TAG_VALUE_LIMIT);
        assert!(clamped.ends_with("..."));
    }

    #[test]
    fn test_limit_applies_after_escaping() {
        // 1000 code points before escaping, 1020 after.
        let value = format!("{}{}", "a".repeat(980), " ".repeat(20));
        assert_eq!(escape_tag_value(&value).chars().count(), 1020);

        let value = format!("{}{}", "a".repeat(1000), ",".repeat(20));
        let escaped = escape_tag_value(&value);
        assert_eq!(escaped.chars().count(), TAG_VALUE_LIMIT);
        assert!(escaped.ends_with("..."));
    }

    #[test]
    fn test_escape_field_string() {
        assert_eq!(escape_field_string("not-afk"), "not-afk");
        assert_eq!(escape_field_string(r#"say "hi" \o/"#), r#"say \"hi\" \\o/"#);
    }

    proptest! {
        #[test]
        fn escaped_values_split_back_to_original(value in "[a-z ,=]{0,64}") {
            let escaped = escape_tag_value(&value);
            for delimiter in [',', '=', ' '] {
                let parts = split_unescaped(&escaped, delimiter);
                prop_assert_eq!(parts.len(), 1);
                prop_assert_eq!(&parts[0], &value);
            }
        }

        #[test]
        fn tag_joined_with_siblings_recovers_value(value in "[a-zA-Z0-9 ,=.]{1,64}") {
            let line = format!("client={},hostname=host", escape_tag_value(&value));
            let pairs = split_unescaped(&line, ',');
            prop_assert_eq!(pairs.len(), 2);
            prop_assert_eq!(pairs[0].strip_prefix("client="), Some(value.as_str()));
        }

        #[test]
        fn long_values_are_clamped_to_limit(value in "\\PC{1025,1500}") {
            let escaped = escape_tag_value(&value);
            prop_assert_eq!(escaped.chars().count(), TAG_VALUE_LIMIT);
            prop_assert!(escaped.ends_with("..."));
        }
    }
}
