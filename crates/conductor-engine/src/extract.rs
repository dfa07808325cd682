//! Tolerant extraction of JSON objects from free-text model output.

use serde::de::DeserializeOwned;

/// Drop a surrounding markdown code fence (```json ... ``` or ``` ... ```).
pub fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// The span from the first `{` to the last `}`, if both exist in that order.
pub fn object_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Decode a `T` out of model output, ignoring fences and surrounding prose.
pub fn decode_object<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    let body = strip_fences(raw);
    let body = object_span(body).unwrap_or(body);
    serde_json::from_str(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Verdict {
        ok: bool,
    }

    #[test]
    fn strips_json_fence() {
        assert_eq!(strip_fences("```json\n{\"ok\":true}\n```"), "{\"ok\":true}");
        assert_eq!(strip_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_fences("  plain "), "plain");
    }

    #[test]
    fn finds_object_inside_prose() {
        let raw = "Sure! Here is the analysis: {\"ok\": true} Hope that helps.";
        assert_eq!(decode_object::<Verdict>(raw).unwrap(), Verdict { ok: true });
    }

    #[test]
    fn span_requires_ordered_braces() {
        assert!(object_span("} nothing {").is_none());
        assert!(object_span("no braces").is_none());
        assert_eq!(object_span("a{b}c"), Some("{b}"));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode_object::<Verdict>("I cannot answer that").is_err());
        assert!(decode_object::<Verdict>("{not json}").is_err());
    }
}
