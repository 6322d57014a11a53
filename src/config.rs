// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session configuration and its JSON form.
//!
//! [`AbliteratorConfig`] names the activation sites to cache, the
//! positive/negative token sets used for scoring, and the chat template.
//! Token sets are optional: a missing set falls back to the Llama-3 default
//! with a warning.
//!
//! # Usage
//!
//! ```
//! use candle_abliterate::AbliteratorConfig;
//!
//! let config = AbliteratorConfig::from_json_str(
//!     r#"{"activation_sites": ["resid_post"], "negative_tokens": [4250, 14931]}"#,
//! )
//! .unwrap();
//! assert_eq!(config.activation_sites, vec!["resid_post"]);
//! let sets = config.token_sets().unwrap();
//! assert_eq!(sets.negative(), &[4250, 14931]);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::corpus::ChatTemplate;
use crate::error::{AbliterationError, Result};
use crate::scoring::TokenSets;

/// Sites cached when none are configured.
pub const DEFAULT_ACTIVATION_SITES: [&str; 4] = ["resid_pre", "resid_post", "mlp_out", "attn_out"];

/// Llama-3 refusal tokens (` cannot`, ` unethical`, ` sorry`, ...).
pub const LLAMA3_NEGATIVE_TOKENS: [u32; 7] = [4250, 14931, 89735, 20451, 11660, 11458, 956];

/// Llama-3 compliance tokens.
pub const LLAMA3_POSITIVE_TOKENS: [u32; 5] = [32, 1271, 8586, 96556, 78145];

/// Default for [`AbliteratorConfig::activation_sites`].
fn default_activation_sites() -> Vec<String> {
    DEFAULT_ACTIVATION_SITES.iter().map(ToString::to_string).collect()
}

// ---------------------------------------------------------------------------
// AbliteratorConfig
// ---------------------------------------------------------------------------

/// Configuration of an abliteration session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbliteratorConfig {
    /// Short site names cached at every layer (`resid_pre`, `mlp_out`, ...).
    #[serde(default = "default_activation_sites")]
    pub activation_sites: Vec<String>,
    /// Compliance-indicative token IDs; Llama-3 defaults when absent.
    #[serde(default)]
    pub positive_tokens: Option<Vec<u32>>,
    /// Refusal-indicative token IDs; Llama-3 defaults when absent.
    #[serde(default)]
    pub negative_tokens: Option<Vec<u32>>,
    /// Template with an `{instruction}` placeholder; Llama-3 when absent.
    #[serde(default)]
    pub chat_template: Option<String>,
}

impl Default for AbliteratorConfig {
    fn default() -> Self {
        Self {
            activation_sites: default_activation_sites(),
            positive_tokens: None,
            negative_tokens: None,
            chat_template: None,
        }
    }
}

impl AbliteratorConfig {
    /// Parse from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Config`] if a field has the wrong type,
    /// the site list is empty, or the template lacks `{instruction}`.
    pub fn from_json(config: &Value) -> Result<Self> {
        let parsed: Self = serde_json::from_value(config.clone())
            .map_err(|e| AbliterationError::Config(format!("invalid session config: {e}")))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Parse from a JSON string.
    ///
    /// # Errors
    ///
    /// Same as [`from_json`](Self::from_json), plus malformed JSON.
    pub fn from_json_str(config: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(config)
            .map_err(|e| AbliterationError::Config(format!("malformed JSON: {e}")))?;
        Self::from_json(&value)
    }

    /// Check the invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Config`] on the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.activation_sites.is_empty() {
            return Err(AbliterationError::Config(
                "activation_sites must name at least one site".into(),
            ));
        }
        if let Some(template) = &self.chat_template {
            ChatTemplate::new(template)?;
        }
        Ok(())
    }

    /// Scoring token sets, with Llama-3 defaults for absent sets.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Config`] if a configured set is empty.
    pub fn token_sets(&self) -> Result<TokenSets> {
        let positive = self.positive_tokens.clone().unwrap_or_else(|| {
            tracing::warn!("positive_tokens not set, defaulting to Llama-3 vocabulary");
            LLAMA3_POSITIVE_TOKENS.to_vec()
        });
        let negative = self.negative_tokens.clone().unwrap_or_else(|| {
            tracing::warn!("negative_tokens not set, defaulting to Llama-3 vocabulary");
            LLAMA3_NEGATIVE_TOKENS.to_vec()
        });
        TokenSets::new(positive, negative)
    }

    /// Chat template, Llama-3 when unset.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Config`] if the template lacks
    /// `{instruction}`.
    pub fn template(&self) -> Result<ChatTemplate> {
        self.chat_template
            .as_deref()
            .map_or_else(|| Ok(ChatTemplate::default()), ChatTemplate::new)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_takes_defaults() {
        let config = AbliteratorConfig::from_json(&serde_json::json!({})).unwrap();
        assert_eq!(config, AbliteratorConfig::default());
        assert_eq!(
            config.activation_sites,
            vec!["resid_pre", "resid_post", "mlp_out", "attn_out"]
        );

        let sets = config.token_sets().unwrap();
        assert_eq!(sets.negative(), &[956, 4250, 11458, 11660, 14931, 20451, 89735]);
        assert_eq!(sets.positive(), &[32, 1271, 8586, 78145, 96556]);
        assert_eq!(config.template().unwrap(), ChatTemplate::llama3());
    }

    #[test]
    fn explicit_fields() {
        let config = AbliteratorConfig::from_json(&serde_json::json!({
            "activation_sites": ["resid_post", "attn_out"],
            "positive_tokens": [5],
            "negative_tokens": [4, 4],
            "chat_template": "<|user|>\n{instruction}<|end|>\n<|assistant|>"
        }))
        .unwrap();
        let sets = config.token_sets().unwrap();
        assert_eq!(sets.positive(), &[5]);
        assert_eq!(sets.negative(), &[4]);
        assert_eq!(config.template().unwrap(), ChatTemplate::phi3());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let wrong_type = serde_json::json!({"activation_sites": "resid_post"});
        assert!(matches!(
            AbliteratorConfig::from_json(&wrong_type),
            Err(AbliterationError::Config(_))
        ));
        let no_sites = serde_json::json!({"activation_sites": []});
        assert!(matches!(
            AbliteratorConfig::from_json(&no_sites),
            Err(AbliterationError::Config(_))
        ));
        let no_placeholder = serde_json::json!({"chat_template": "hello"});
        assert!(matches!(
            AbliteratorConfig::from_json(&no_placeholder),
            Err(AbliterationError::Config(_))
        ));
        assert!(AbliteratorConfig::from_json_str("{").is_err());
    }

    #[test]
    fn empty_token_set_is_an_error() {
        let config = AbliteratorConfig {
            negative_tokens: Some(Vec::new()),
            ..AbliteratorConfig::default()
        };
        assert!(matches!(
            config.token_sets(),
            Err(AbliterationError::Config(_))
        ));
    }
}
