//! Architecture configuration shared by every decoder variant.

use kiln_core::{Device, KilnError, Result};
use serde::{Deserialize, Serialize};

/// Fixes the architecture before a model is built.
///
/// Constructors take the config by reference and copy what they need, so a
/// config is never mutated after it has been handed to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    /// Longest sequence the position table and causal mask cover.
    pub context_window: usize,
    pub head_count: usize,
    pub layer_count: usize,
    #[serde(default)]
    pub dropout: f32,
    /// Learned additive bias in the bias-optional norms.
    #[serde(default = "default_bias")]
    pub bias: bool,
    #[serde(default)]
    pub device: Device,
}

fn default_bias() -> bool {
    true
}

impl ModelConfig {
    /// No dropout, biased norms, CPU.
    pub fn new(
        vocab_size: usize,
        embedding_dim: usize,
        context_window: usize,
        head_count: usize,
        layer_count: usize,
    ) -> Self {
        Self {
            vocab_size,
            embedding_dim,
            context_window,
            head_count,
            layer_count,
            dropout: 0.0,
            bias: true,
            device: Device::Cpu,
        }
    }

    /// A character-level config small enough for tests and benches.
    pub fn tiny() -> Self {
        Self::new(65, 32, 16, 4, 2)
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Width of one attention head.
    pub fn head_size(&self) -> usize {
        if self.head_count == 0 {
            0
        } else {
            self.embedding_dim / self.head_count
        }
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("embedding_dim", self.embedding_dim),
            ("context_window", self.context_window),
            ("head_count", self.head_count),
            ("layer_count", self.layer_count),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(KilnError::InvalidConfig(format!("{name} must be > 0")));
        }
        if self.embedding_dim % self.head_count != 0 {
            return Err(KilnError::InvalidConfig(format!(
                "embedding_dim {} is not divisible by head_count {}",
                self.embedding_dim, self.head_count
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(KilnError::InvalidConfig(format!("dropout {} outside [0, 1)", self.dropout)));
        }
        self.device.ensure_available()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| KilnError::Serialization(format!("config encode error: {e}")))
    }

    /// Parse and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| KilnError::Serialization(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ModelConfig::new(10, 8, 4, 2, 1);
        assert_eq!(config.dropout, 0.0);
        assert!(config.bias);
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.head_size(), 4);
        assert!(config.validate().is_ok());
        assert!(ModelConfig::tiny().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_indivisible_heads() {
        let err = ModelConfig::new(10, 8, 4, 3, 1).validate().unwrap_err();
        assert!(matches!(err, KilnError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ModelConfig::new(0, 8, 4, 2, 1).validate().is_err());
        assert!(ModelConfig::new(10, 8, 4, 0, 1).validate().is_err());
        assert!(ModelConfig::new(10, 8, 4, 2, 1).with_dropout(1.0).validate().is_err());
        assert!(matches!(
            ModelConfig::new(10, 8, 4, 2, 1).with_device(Device::Cuda(0)).validate(),
            Err(KilnError::UnsupportedDevice(_))
        ));
    }

    #[test]
    fn test_json_roundtrip_and_defaults() {
        let config = ModelConfig::new(10, 8, 4, 2, 1).with_dropout(0.1).with_bias(false);
        let parsed = ModelConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);

        let minimal = r#"{"vocab_size": 5, "embedding_dim": 4, "context_window": 3, "head_count": 1, "layer_count": 1}"#;
        let parsed = ModelConfig::from_json(minimal).unwrap();
        assert!(parsed.bias);
        assert_eq!(parsed.dropout, 0.0);

        let invalid = r#"{"vocab_size": 5, "embedding_dim": 4, "context_window": 3, "head_count": 3, "layer_count": 1}"#;
        assert!(ModelConfig::from_json(invalid).is_err());
    }
}
