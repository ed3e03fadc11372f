//! Config - JSON-configured construction of learner stacks.
//!
//! A [`StackConfig`] describes a chain of accumulating linear learners
//! (layer widths, learning rates, seeds and the per-node step priority) and
//! builds the corresponding [`Node`] stack after validation. Configs
//! load from JSON strings or files.

use crate::error::{Result, TelosError};
use crate::machines::AccLinearLearner;
use crate::network::Node;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// One dense layer in a configured stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerConfig {
    /// Input width.
    pub in_features: usize,
    /// Output width.
    pub out_features: usize,
    /// SGD learning rate.
    #[serde(default = "default_lr")]
    pub lr: f32,
    /// RNG seed for parameter init.
    #[serde(default)]
    pub seed: u64,
}

fn default_lr() -> f32 {
    0.1
}

/// A chain of dense layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Layers, input side first.
    pub layers: Vec<LayerConfig>,
    /// Whether nodes step before computing their input correction.
    #[serde(default)]
    pub step_priority: bool,
}

impl StackConfig {
    /// Parse a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StackConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Check the stack is non-empty, every width is positive and adjacent
    /// layers agree on their shared width.
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(TelosError::InvalidParameter(
                "a stack needs at least one layer".into(),
            ));
        }
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.in_features == 0 || layer.out_features == 0 {
                return Err(TelosError::InvalidParameter(format!(
                    "layer {} has a zero width",
                    i
                )));
            }
            if layer.lr <= 0.0 {
                return Err(TelosError::InvalidParameter(format!(
                    "layer {} has a non-positive learning rate",
                    i
                )));
            }
        }
        for (i, pair) in self.layers.windows(2).enumerate() {
            if pair[0].out_features != pair[1].in_features {
                return Err(TelosError::InvalidParameter(format!(
                    "layer {} outputs {} features but layer {} expects {}",
                    i,
                    pair[0].out_features,
                    i + 1,
                    pair[1].in_features
                )));
            }
        }
        Ok(())
    }

    /// Build one accumulating node per configured layer.
    pub fn build_nodes(&self) -> Result<Vec<Rc<Node>>> {
        self.validate()?;
        Ok(self
            .layers
            .iter()
            .map(|layer| {
                Node::accumulating(
                    AccLinearLearner::new(
                        layer.in_features,
                        layer.out_features,
                        layer.lr,
                        layer.seed,
                    ),
                    self.step_priority,
                )
            })
            .collect())
    }
}
