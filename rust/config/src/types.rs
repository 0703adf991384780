//! Trainer enums, model identifiers, and flag value formatting.

use serde::{Deserialize, Serialize};

/// Errors from parsing enum values and identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown optimiser '{0}'. Use: sgd, adam")]
    Optimiser(String),
    #[error("unknown training mode '{0}'. Use: supervised, semi-supervised, gmm")]
    TrainingMode(String),
    #[error("invalid model identifier '{0}': expected ASCII letters, digits, '-', '_' or '.'")]
    Model(String),
}

/// Optimiser selected by the trainer.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Optimiser {
    Sgd,
    #[default]
    Adam,
}

impl std::fmt::Display for Optimiser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sgd => write!(f, "sgd"),
            Self::Adam => write!(f, "adam"),
        }
    }
}

impl std::str::FromStr for Optimiser {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            _ => Err(ParseError::Optimiser(s.to_string())),
        }
    }
}

/// How the trainer uses labels.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TrainingMode {
    Supervised,
    /// Pseudo-labels the unlabelled split every epoch.
    #[serde(alias = "self-supervised", alias = "ssl")]
    SemiSupervised,
    /// Gaussian mixture clustering baseline, no network.
    Gmm,
}

impl std::fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supervised => write!(f, "supervised"),
            Self::SemiSupervised => write!(f, "semi-supervised"),
            Self::Gmm => write!(f, "gmm"),
        }
    }
}

impl std::str::FromStr for TrainingMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "supervised" => Ok(Self::Supervised),
            "semi-supervised" | "self-supervised" | "ssl" => Ok(Self::SemiSupervised),
            "gmm" => Ok(Self::Gmm),
            _ => Err(ParseError::TrainingMode(s.to_string())),
        }
    }
}

/// Model identifier understood by the trainer, e.g. `twolayercnn`.
///
/// The trainer owns the model catalogue, so this only checks that the value
/// is a single shell-safe token.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModelId(String);

impl ModelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ModelId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(ParseError::Model(s.to_string()))
        }
    }
}

impl Serialize for ModelId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ModelId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Render a float the way hyperparameters are usually written by hand.
///
/// Magnitudes below `1e-3` use exponent form (`5e-4`), everything else the
/// shortest decimal form (`0.001`, `0.1`, `1`).
pub fn format_float(value: f64) -> String {
    if value != 0.0 && value.abs() < 1e-3 {
        format!("{value:e}")
    } else {
        format!("{value}")
    }
}
