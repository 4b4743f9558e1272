//! Construction settings for [`DeepLabV3Decoder`](crate::DeepLabV3Decoder).
//!
//! Settings can be built in code with the `with_*` methods or read from JSON.
//! Every field except `in_channels` has a default, so the smallest valid
//! document is `{"in_channels": 2048}`.

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{DecoderError, DecoderResult};

/// Rates suited to encoders with an output stride of 16.
pub const DEFAULT_ATROUS_RATES: [usize; 3] = [12, 24, 36];
pub const DEFAULT_OUT_CHANNELS: usize = 256;
pub const DEFAULT_SEED: u64 = 42;

fn default_out_channels() -> usize {
    DEFAULT_OUT_CHANNELS
}

fn default_atrous_rates() -> Vec<usize> {
    DEFAULT_ATROUS_RATES.to_vec()
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Channels of the deepest encoder feature map.
    pub in_channels: usize,
    /// Channels produced by the ASPP block and the refinement stage.
    #[serde(default = "default_out_channels")]
    pub out_channels: usize,
    /// Dilation rates of the three atrous branches.
    #[serde(default = "default_atrous_rates")]
    pub atrous_rates: Vec<usize>,
    /// Use depthwise-separable convolutions in the atrous branches.
    #[serde(default)]
    pub separable: bool,
    /// Seed for parameter initialisation.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl DecoderConfig {
    pub fn new(in_channels: usize) -> Self {
        Self {
            in_channels,
            out_channels: DEFAULT_OUT_CHANNELS,
            atrous_rates: DEFAULT_ATROUS_RATES.to_vec(),
            separable: false,
            seed: DEFAULT_SEED,
        }
    }

    pub fn with_out_channels(mut self, out_channels: usize) -> Self {
        self.out_channels = out_channels;
        self
    }

    pub fn with_atrous_rates(mut self, rates: &[usize]) -> Self {
        self.atrous_rates = rates.to_vec();
        self
    }

    pub fn with_separable(mut self, separable: bool) -> Self {
        self.separable = separable;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check channel counts and rates before any layer is allocated.
    pub fn validate(&self) -> DecoderResult<()> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(DecoderError::InvalidConfig(format!(
                "channel counts must be positive (in_channels = {}, out_channels = {})",
                self.in_channels, self.out_channels
            )));
        }
        validate_rates(&self.atrous_rates)?;
        Ok(())
    }

    pub fn from_json_str(json: &str) -> DecoderResult<Self> {
        let config: DecoderConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> DecoderResult<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> DecoderResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Exactly three rates, none of them zero.
pub(crate) fn validate_rates(rates: &[usize]) -> DecoderResult<[usize; 3]> {
    let triple: [usize; 3] = rates
        .try_into()
        .map_err(|_| DecoderError::InvalidAtrousRates { got: rates.to_vec() })?;
    if triple.contains(&0) {
        return Err(DecoderError::InvalidConfig(format!(
            "atrous rates must be at least 1, got {:?}",
            rates
        )));
    }
    Ok(triple)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DecoderConfig::new(2048);
        assert_eq!(config.out_channels, 256);
        assert_eq!(config.atrous_rates, vec![12, 24, 36]);
        assert!(!config.separable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_fills_defaults() {
        let config = DecoderConfig::from_json_str(r#"{"in_channels": 512}"#).unwrap();
        assert_eq!(config, DecoderConfig::new(512));

        let config = DecoderConfig::from_json_str(
            r#"{"in_channels": 64, "out_channels": 32, "atrous_rates": [6, 12, 18], "separable": true}"#,
        )
        .unwrap();
        assert_eq!(config.atrous_rates, vec![6, 12, 18]);
        assert!(config.separable);
        assert_eq!(config.seed, DEFAULT_SEED);
    }

    #[test]
    fn test_json_requires_in_channels() {
        let err = DecoderConfig::from_json_str(r#"{"out_channels": 256}"#).unwrap_err();
        assert!(matches!(err, DecoderError::Json(_)));
    }

    #[test]
    fn test_json_round_trip() {
        let config = DecoderConfig::new(8).with_atrous_rates(&[1, 2, 3]).with_seed(7);
        let json = config.to_json_string().unwrap();
        assert_eq!(DecoderConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_json_file() {
        let path = std::env::temp_dir().join(format!("oxidize-seg-config-{}.json", std::process::id()));
        fs::write(&path, r#"{"in_channels": 3, "separable": true}"#).unwrap();
        let config = DecoderConfig::from_json_file(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(config.in_channels, 3);
        assert!(config.separable);

        let missing = DecoderConfig::from_json_file(path.with_extension("missing"));
        assert!(matches!(missing, Err(DecoderError::Io(_))));
    }

    #[test]
    fn test_rate_validation() {
        assert_eq!(validate_rates(&[6, 12, 18]).unwrap(), [6, 12, 18]);
        assert!(matches!(
            validate_rates(&[6, 12]),
            Err(DecoderError::InvalidAtrousRates { got }) if got == vec![6, 12]
        ));
        assert!(matches!(
            validate_rates(&[1, 2, 3, 4]),
            Err(DecoderError::InvalidAtrousRates { .. })
        ));
        assert!(matches!(validate_rates(&[0, 1, 2]), Err(DecoderError::InvalidConfig(_))));

        let config = DecoderConfig::new(4).with_out_channels(0);
        assert!(matches!(config.validate(), Err(DecoderError::InvalidConfig(_))));
        assert!(DecoderConfig::from_json_str(r#"{"in_channels": 4, "atrous_rates": [1]}"#).is_err());
    }
}
