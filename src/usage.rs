//! Normalization of provider-specific usage payloads into a canonical
//! token triple. Parsing is tolerant: every known family is probed with
//! optional-field fallbacks, and a shape that matches nothing yields the
//! all-zero triple with `recognized = false` rather than an error, so a
//! completed inference is never failed by billing.

use serde_json::Value;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NormalizedUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub recognized: bool,
}

impl NormalizedUsage {
    pub fn new(input_tokens: u64, output_tokens: u64, cached_input_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cached_input_tokens,
            recognized: true,
        }
    }

    pub fn unrecognized() -> Self {
        Self::default()
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Closed set of usage payload families the normalizer understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderFamily {
    OpenAi,
    Anthropic,
    Google,
}

impl ProviderFamily {
    /// Maps a provider identifier to its payload family. Unknown providers
    /// get `None`; the normalizer then probes every family before giving up.
    pub fn from_provider_id(provider_id: &str) -> Option<Self> {
        let id = provider_id.to_ascii_lowercase();
        if id.starts_with("openai") || id.starts_with("azure") || id == "openrouter" {
            Some(ProviderFamily::OpenAi)
        } else if id.starts_with("anthropic") || id == "claude" {
            Some(ProviderFamily::Anthropic)
        } else if id.starts_with("google") || id.starts_with("gemini") || id.starts_with("vertex") {
            Some(ProviderFamily::Google)
        } else {
            None
        }
    }
}

/// Normalizes a raw provider usage payload into the canonical token triple.
pub fn normalize_usage(provider_id: &str, payload: &Value) -> NormalizedUsage {
    let parsed = match ProviderFamily::from_provider_id(provider_id) {
        Some(ProviderFamily::OpenAi) => parse_openai_usage(payload),
        Some(ProviderFamily::Anthropic) => parse_anthropic_usage(payload),
        Some(ProviderFamily::Google) => parse_google_usage(payload),
        None => parse_openai_usage(payload)
            .or_else(|| parse_anthropic_usage(payload))
            .or_else(|| parse_google_usage(payload)),
    };
    match parsed {
        Some(usage) => usage,
        None => {
            tracing::warn!(provider_id, "unrecognized usage payload shape");
            NormalizedUsage::unrecognized()
        }
    }
}

fn parse_openai_usage(payload: &Value) -> Option<NormalizedUsage> {
    let obj = usage_object(payload)?;
    let input = obj
        .get("prompt_tokens")
        .or_else(|| obj.get("input_tokens"))
        .and_then(Value::as_u64)?;
    let output = obj
        .get("completion_tokens")
        .or_else(|| obj.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let cached = obj
        .get("prompt_tokens_details")
        .or_else(|| obj.get("input_tokens_details"))
        .and_then(Value::as_object)
        .and_then(|details| details.get("cached_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(NormalizedUsage::new(input, output, cached))
}

fn parse_anthropic_usage(payload: &Value) -> Option<NormalizedUsage> {
    let obj = usage_object(payload)?;
    let input = obj.get("input_tokens").and_then(Value::as_u64)?;
    let output = obj.get("output_tokens").and_then(Value::as_u64)?;
    let cached = obj
        .get("cache_read_input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(NormalizedUsage::new(input, output, cached))
}

fn parse_google_usage(payload: &Value) -> Option<NormalizedUsage> {
    let obj = payload
        .get("usageMetadata")
        .or_else(|| payload.get("usage_metadata"))
        .and_then(Value::as_object)
        .or_else(|| payload.as_object())?;
    let input = obj.get("promptTokenCount").and_then(Value::as_u64)?;
    let output = obj
        .get("candidatesTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let cached = obj
        .get("cachedContentTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(NormalizedUsage::new(input, output, cached))
}

/// Accepts either the bare usage object or a full response carrying a
/// `usage` field.
fn usage_object(payload: &Value) -> Option<&serde_json::Map<String, Value>> {
    if let Some(usage) = payload.get("usage").and_then(Value::as_object) {
        return Some(usage);
    }
    payload.as_object()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_openai_shape() {
        let usage = normalize_usage(
            "openai",
            &json!({"usage": {
                "prompt_tokens": 120,
                "completion_tokens": 30,
                "prompt_tokens_details": {"cached_tokens": 40}
            }}),
        );
        assert!(usage.recognized);
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 30);
        assert_eq!(usage.cached_input_tokens, 40);
    }

    #[test]
    fn parses_anthropic_shape() {
        let usage = normalize_usage(
            "anthropic",
            &json!({"input_tokens": 200, "output_tokens": 55, "cache_read_input_tokens": 10}),
        );
        assert!(usage.recognized);
        assert_eq!(usage.input_tokens, 200);
        assert_eq!(usage.output_tokens, 55);
        assert_eq!(usage.cached_input_tokens, 10);
    }

    #[test]
    fn parses_google_shape() {
        let usage = normalize_usage(
            "google-gemini",
            &json!({"usageMetadata": {
                "promptTokenCount": 80,
                "candidatesTokenCount": 25,
                "cachedContentTokenCount": 5
            }}),
        );
        assert!(usage.recognized);
        assert_eq!(usage.input_tokens, 80);
        assert_eq!(usage.output_tokens, 25);
        assert_eq!(usage.cached_input_tokens, 5);
    }

    #[test]
    fn unknown_provider_probes_all_families() {
        let usage = normalize_usage("acme", &json!({"input_tokens": 9, "output_tokens": 3}));
        assert!(usage.recognized);
        assert_eq!(usage.input_tokens, 9);
        assert_eq!(usage.output_tokens, 3);
    }

    #[test]
    fn unrecognized_shape_yields_zero_triple_with_flag() {
        let usage = normalize_usage("openai", &json!({"tokens": "lots"}));
        assert!(!usage.recognized);
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.output_tokens, 0);
        assert_eq!(usage.cached_input_tokens, 0);
    }
}
