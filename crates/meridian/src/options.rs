//! Session configuration

use meridian_core::{Error, Result};
use meridian_optimizer::{ConstantFoldingOptions, GraphOptimizationLevel, DEFAULT_MAX_STEPS};
use serde::{Deserialize, Serialize};

/// A provider the session creates from configuration.
///
/// Configured providers are tried after the ones registered on the builder,
/// in the order listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Cpu {
        #[serde(default = "enabled")]
        use_arena: bool,
    },
    /// Needs a device registry on the builder.
    GpuSim {
        #[serde(default)]
        device_id: u32,
        #[serde(default = "enabled")]
        use_arena: bool,
    },
}

fn enabled() -> bool {
    true
}

/// Options fixed when a session is built.
///
/// Every field has a default, so a JSON document only needs the keys it
/// changes:
///
/// ```rust
/// use meridian::SessionOptions;
/// use meridian_optimizer::GraphOptimizationLevel;
///
/// let options = SessionOptions::from_json(r#"{"graph_optimization_level": "Basic"}"#).unwrap();
/// assert_eq!(options.graph_optimization_level, GraphOptimizationLevel::Basic);
/// assert_eq!(options.max_transform_steps, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Intra-op worker threads. 0 picks a default from the machine; 1 runs
    /// every parallel region on the calling thread.
    pub intra_op_num_threads: usize,
    pub graph_optimization_level: GraphOptimizationLevel,
    /// Sweep cap per transformer level
    pub max_transform_steps: usize,
    /// Arena for the fallback CPU provider
    pub cpu_use_arena: bool,
    pub constant_folding: ConstantFoldingOptions,
    pub providers: Vec<ProviderConfig>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            intra_op_num_threads: 0,
            graph_optimization_level: GraphOptimizationLevel::default(),
            max_transform_steps: DEFAULT_MAX_STEPS,
            cpu_use_arena: true,
            constant_folding: ConstantFoldingOptions::default(),
            providers: Vec::new(),
        }
    }
}

impl SessionOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| Error::invalid_argument(format!("invalid session options: {err}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| Error::invalid_argument(format!("cannot serialize session options: {err}")))
    }

    pub fn with_intra_op_num_threads(mut self, threads: usize) -> Self {
        self.intra_op_num_threads = threads;
        self
    }

    pub fn with_optimization_level(mut self, level: GraphOptimizationLevel) -> Self {
        self.graph_optimization_level = level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SessionOptions::default();
        assert_eq!(options.graph_optimization_level, GraphOptimizationLevel::All);
        assert!(options.cpu_use_arena);
        assert!(options.constant_folding.foldable_domains.contains(""));
    }

    #[test]
    fn test_json_round_trip() {
        let mut options = SessionOptions::default().with_intra_op_num_threads(3);
        options.constant_folding.foldable_domains.insert("com.vendor".to_string());
        let parsed = SessionOptions::from_json(&options.to_json().unwrap()).unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn test_nested_partial_json() {
        let options = SessionOptions::from_json(
            r#"{"cpu_use_arena": false, "constant_folding": {"compatible_providers": ["CPUExecutionProvider"]}}"#,
        )
        .unwrap();
        assert!(!options.cpu_use_arena);
        assert_eq!(options.constant_folding.compatible_providers.len(), 1);
        // unspecified nested fields keep their defaults
        assert_eq!(options.constant_folding.foldable_domains.len(), 2);
    }

    #[test]
    fn test_provider_configs() {
        let options = SessionOptions::from_json(
            r#"{"providers": [{"kind": "gpu_sim", "device_id": 1}, {"kind": "cpu", "use_arena": false}]}"#,
        )
        .unwrap();
        assert_eq!(
            options.providers,
            vec![
                ProviderConfig::GpuSim {
                    device_id: 1,
                    use_arena: true
                },
                ProviderConfig::Cpu { use_arena: false },
            ]
        );
    }

    #[test]
    fn test_invalid_json_is_an_invalid_argument() {
        let err = SessionOptions::from_json(r#"{"intra_op_num_threads": -1}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
