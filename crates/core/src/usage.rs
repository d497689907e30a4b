use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

impl Usage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64, total_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens <= 0 && self.completion_tokens <= 0 && self.total_tokens <= 0
    }

    /// Re-derives completion tokens when upstream reports a value that cannot be right
    /// (negative, or larger than the reported total).
    pub fn normalized(self) -> Self {
        let mut out = self;
        if out.total_tokens <= 0 {
            out.total_tokens = out.prompt_tokens.max(0) + out.completion_tokens.max(0);
            return out;
        }
        if out.completion_tokens < 0 || out.completion_tokens > out.total_tokens {
            out.completion_tokens = (out.total_tokens - out.prompt_tokens).max(0);
        }
        out
    }
}

/// Usage rewrite applied to outputs that embed generated media links.
///
/// Some workflow upstreams report per-media token counts far above their real cost;
/// when the marker shows up in the output the completion count is re-estimated as
/// text tokens plus a fixed allowance per marker occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputUnitCorrection {
    pub enabled: bool,
    pub marker: String,
    pub tokens_per_unit: i64,
    pub chars_per_token: i64,
    pub min_text_tokens: i64,
}

impl Default for OutputUnitCorrection {
    fn default() -> Self {
        Self {
            enabled: true,
            marker: "tos-cn-beijing.volces.com/doubao-seedance".to_string(),
            tokens_per_unit: 5000,
            chars_per_token: 3,
            min_text_tokens: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectedUsage {
    pub usage: Usage,
    pub units: i64,
    pub text_tokens: i64,
}

impl OutputUnitCorrection {
    pub fn apply(&self, usage: Usage, output: &str) -> Option<CorrectedUsage> {
        if !self.enabled || self.marker.is_empty() || self.tokens_per_unit <= 0 {
            return None;
        }
        let units = output.matches(self.marker.as_str()).count() as i64;
        if units == 0 {
            return None;
        }
        let chars_per_token = self.chars_per_token.max(1);
        let text_tokens = (output.len() as i64 / chars_per_token).max(self.min_text_tokens);
        let completion_tokens = text_tokens + units * self.tokens_per_unit;
        let prompt_tokens = usage.prompt_tokens.max(0);
        Some(CorrectedUsage {
            usage: Usage::new(prompt_tokens, completion_tokens, prompt_tokens + completion_tokens),
            units,
            text_tokens,
        })
    }
}
