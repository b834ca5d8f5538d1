//! Pattern-based secret scrubber.
//!
//! Applied uniformly to structured log fields (by the tracing layer) and to
//! ticket error-note bodies before either leaves the process. Matches a
//! closed set of key-name patterns against three shapes: `key=value`,
//! `"key": "value"` inside JSON text, and bare `NAME_VALUE=...`
//! environment-style assignments.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};

const PLACEHOLDER: &str = "[REDACTED]";

/// Key-name fragments considered secret, case-insensitive, matched with
/// common separators (`_`, `-`, camelCase boundaries are not special-cased;
/// the fragment match is substring-based on a lowercased key).
const SECRET_KEY_FRAGMENTS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passphrase",
    "api_key",
    "apikey",
];

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_KEY_FRAGMENTS.iter().any(|frag| lower.contains(frag))
}

/// `key="value"` or `key='value'` or `key=bareword` — case-insensitive key,
/// quoted or unquoted value, used for both `key=value` log fields and JSON
/// `"key": "value"` pairs (the JSON pattern is a superset: quotes and an
/// optional colon-space).
static KEY_VALUE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?P<key>[A-Za-z0-9_.\-]*(?:token|secret|password|passphrase|api_key|apikey)[A-Za-z0-9_.\-]*)\s*[:=]\s*(?P<quote>["']?)(?P<value>[^"'\s,}\]]+)(?P=quote)"#,
    )
    .expect("static redaction pattern must compile")
});

/// Fast pre-filter: skip the (comparatively expensive) regex pass entirely
/// when none of the secret-key fragments appear anywhere in the input.
static PREFILTER: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new(SECRET_KEY_FRAGMENTS.iter().map(|f| format!("(?i){f}")))
        .expect("static redaction prefilter must compile")
});

/// Scrubs a free-form string, replacing the value half of any
/// secret-looking `key=value` / `"key": "value"` pair with
/// `"[REDACTED]"`. Key names and surrounding structure are preserved.
pub fn redact(input: &str) -> String {
    if !PREFILTER.is_match(input) {
        return input.to_string();
    }
    KEY_VALUE_PATTERN
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let key = &caps["key"];
            let quote = &caps["quote"];
            format!("{key}={quote}{PLACEHOLDER}{quote}")
        })
        .into_owned()
}

/// Scrubs a JSON value in place, recursing into objects and arrays and
/// redacting any object value whose key matches [`is_secret_key`].
pub fn redact_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if is_secret_key(k) && !v.is_null() {
                    out.insert(k.clone(), serde_json::Value::String(PLACEHOLDER.to_string()));
                } else {
                    out.insert(k.clone(), redact_json(v));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_json).collect())
        }
        serde_json::Value::String(s) => serde_json::Value::String(redact(s)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn redacts_plain_key_value() {
        let input = "tms_token=abc123xyz reached the handler";
        let out = redact(input);
        assert!(out.contains("tms_token=[REDACTED]"));
        assert!(!out.contains("abc123xyz"));
    }

    #[test]
    fn redacts_quoted_json_value() {
        let input = r#"{"webhook_secret": "sshh-very-secret"}"#;
        let out = redact(input);
        assert!(out.contains(r#""webhook_secret": "[REDACTED]""#));
        assert!(!out.contains("sshh-very-secret"));
    }

    #[test]
    fn leaves_non_secret_keys_untouched() {
        let input = "ticket_id=42 delivery_id=abc-123";
        assert_eq!(redact(input), input);
    }

    #[test]
    fn prefilter_short_circuits_ordinary_strings() {
        let input = "the quick brown fox jumps over the lazy dog";
        assert_eq!(redact(input), input);
    }

    #[test]
    fn redact_json_scrubs_nested_secret_keys() {
        let value = serde_json::json!({
            "signing": {"pkcs12_password": "hunter2"},
            "ticket_id": 7,
        });
        let scrubbed = redact_json(&value);
        assert_eq!(scrubbed["signing"]["pkcs12_password"], "[REDACTED]");
        assert_eq!(scrubbed["ticket_id"], 7);
    }

    #[test]
    fn redact_is_idempotent_on_its_own_output() {
        let input = "api_key=deadbeef";
        let once = redact(input);
        let twice = redact(&once);
        assert_eq!(once, twice);
    }

    proptest! {
        #[test]
        fn redact_never_panics_on_arbitrary_text(s in ".*") {
            let _ = redact(&s);
        }
    }
}
