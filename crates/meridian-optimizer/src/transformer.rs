//! Graph transformer pipeline
//!
//! Passes are grouped by [`TransformerLevel`]. For each enabled level the
//! manager sweeps the level's passes in registration order, re-resolving the
//! graph after every pass, and repeats until a whole sweep changes nothing
//! or the step cap is reached.

use std::fmt;

use meridian_core::{Error, Graph, Result};
use serde::{Deserialize, Serialize};

/// Sweeps per level when none is configured.
pub const DEFAULT_MAX_STEPS: usize = 5;

/// A semantics-preserving graph rewrite.
pub trait GraphTransformer: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Rewrite `graph` in place. The graph is resolved on entry. Returns
    /// whether anything changed.
    fn apply(&self, graph: &mut Graph) -> Result<bool>;
}

/// Group a pass belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransformerLevel {
    /// Semantics-preserving, provider-independent rewrites
    Basic,
    /// Rewrites that may change the node set more aggressively
    Extended,
}

/// How much optimization a session applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum GraphOptimizationLevel {
    DisableAll,
    Basic,
    Extended,
    #[default]
    All,
}

impl GraphOptimizationLevel {
    /// Transformer levels enabled at this setting, in execution order.
    pub fn transformer_levels(self) -> &'static [TransformerLevel] {
        match self {
            GraphOptimizationLevel::DisableAll => &[],
            GraphOptimizationLevel::Basic => &[TransformerLevel::Basic],
            GraphOptimizationLevel::Extended | GraphOptimizationLevel::All => {
                &[TransformerLevel::Basic, TransformerLevel::Extended]
            }
        }
    }
}

/// Outcome of [`GraphTransformerManager::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformReport {
    pub modified: bool,
    /// Sweeps run, over all levels
    pub steps: usize,
    /// Names of passes that changed the graph, once per change
    pub applied: Vec<String>,
    /// Levels that stopped at the step cap before converging
    pub capped_levels: Vec<TransformerLevel>,
}

/// Runs registered passes level by level until they converge.
#[derive(Debug)]
pub struct GraphTransformerManager {
    max_steps: usize,
    transformers: Vec<(TransformerLevel, Box<dyn GraphTransformer>)>,
}

impl Default for GraphTransformerManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STEPS)
    }
}

impl GraphTransformerManager {
    pub fn new(max_steps: usize) -> Self {
        Self {
            max_steps,
            transformers: Vec::new(),
        }
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn register(&mut self, level: TransformerLevel, transformer: Box<dyn GraphTransformer>) {
        tracing::trace!(pass = transformer.name(), ?level, "transformer_registered");
        self.transformers.push((level, transformer));
    }

    /// Names of the passes at `level`, in order.
    pub fn transformer_names(&self, level: TransformerLevel) -> Vec<&str> {
        self.passes(level).map(|transformer| transformer.name()).collect()
    }

    /// Optimize `graph` at `optimization_level`.
    ///
    /// A pass that leaves the graph unresolvable aborts the pipeline with a
    /// [`Error::GraphIntegrity`] naming the pass.
    pub fn apply(&self, graph: &mut Graph, optimization_level: GraphOptimizationLevel) -> Result<TransformReport> {
        graph.resolve()?;
        let mut report = TransformReport::default();

        for &level in optimization_level.transformer_levels() {
            let mut converged = false;
            for step in 0..self.max_steps {
                report.steps += 1;
                let mut modified = false;
                for transformer in self.passes(level) {
                    if self.apply_pass(transformer, graph)? {
                        modified = true;
                        report.applied.push(transformer.name().to_string());
                    }
                }
                tracing::debug!(?level, step, modified, nodes = graph.node_count(), "transform_sweep_complete");
                if !modified {
                    converged = true;
                    break;
                }
                report.modified = true;
            }

            if !converged && self.max_steps > 0 {
                tracing::warn!(
                    ?level,
                    max_steps = self.max_steps,
                    "graph transformers did not converge within the step cap"
                );
                report.capped_levels.push(level);
            }
        }

        Ok(report)
    }

    fn passes(&self, level: TransformerLevel) -> impl Iterator<Item = &dyn GraphTransformer> {
        self.transformers
            .iter()
            .filter(move |(l, _)| *l == level)
            .map(|(_, transformer)| transformer.as_ref())
    }

    fn apply_pass(&self, transformer: &dyn GraphTransformer, graph: &mut Graph) -> Result<bool> {
        let name = transformer.name();
        let _span = meridian_tracing::perf_span!("graph_transformer", pass = name);
        let modified = transformer
            .apply(graph)
            .map_err(|err| Error::graph_integrity(format!("transformer '{name}' failed: {err}")))?;
        graph
            .resolve()
            .map_err(|err| Error::graph_integrity(format!("graph invalid after transformer '{name}': {err}")))?;
        if modified {
            tracing::debug!(pass = name, nodes = graph.node_count(), "transformer_modified_graph");
        }
        Ok(modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use meridian_core::graph::{NodeDef, TypeInfo};
    use meridian_core::DataType;

    /// Reports a change the first `changes` times it runs.
    #[derive(Debug)]
    struct Countdown {
        changes: usize,
        calls: AtomicUsize,
    }

    impl GraphTransformer for Countdown {
        fn name(&self) -> &str {
            "Countdown"
        }

        fn apply(&self, _graph: &mut Graph) -> Result<bool> {
            Ok(self.calls.fetch_add(1, Ordering::Relaxed) < self.changes)
        }
    }

    /// Wires a node to an undefined value.
    #[derive(Debug)]
    struct Breaker;

    impl GraphTransformer for Breaker {
        fn name(&self) -> &str {
            "Breaker"
        }

        fn apply(&self, graph: &mut Graph) -> Result<bool> {
            graph.add_node(NodeDef::new("Relu").inputs(["nowhere"]).outputs(["broken"]));
            Ok(true)
        }
    }

    fn graph() -> Graph {
        let mut graph = Graph::new("g");
        graph.add_input("x", TypeInfo::new(DataType::F32, [1]));
        graph.add_node(NodeDef::new("Relu").inputs(["x"]).outputs(["y"]));
        graph.add_output("y");
        graph
    }

    fn countdown(changes: usize) -> Box<Countdown> {
        Box::new(Countdown {
            changes,
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_runs_until_a_sweep_changes_nothing() {
        let mut manager = GraphTransformerManager::new(5);
        manager.register(TransformerLevel::Basic, countdown(2));
        let report = manager.apply(&mut graph(), GraphOptimizationLevel::Basic).unwrap();
        assert!(report.modified);
        assert_eq!(report.steps, 3);
        assert_eq!(report.applied, vec!["Countdown", "Countdown"]);
        assert!(report.capped_levels.is_empty());
    }

    #[test]
    fn test_step_cap_stops_the_loop() {
        let mut manager = GraphTransformerManager::new(3);
        manager.register(TransformerLevel::Basic, countdown(100));
        let report = manager.apply(&mut graph(), GraphOptimizationLevel::Basic).unwrap();
        assert_eq!(report.steps, 3);
        assert_eq!(report.capped_levels, vec![TransformerLevel::Basic]);
    }

    #[test]
    fn test_levels_follow_the_optimization_setting() {
        let mut manager = GraphTransformerManager::default();
        manager.register(TransformerLevel::Extended, countdown(1));
        let report = manager.apply(&mut graph(), GraphOptimizationLevel::Basic).unwrap();
        assert_eq!(report.steps, 1);
        assert!(!report.modified);

        let report = manager.apply(&mut graph(), GraphOptimizationLevel::DisableAll).unwrap();
        assert_eq!(report.steps, 0);

        let report = manager.apply(&mut graph(), GraphOptimizationLevel::All).unwrap();
        assert!(report.modified);
    }

    #[test]
    fn test_broken_graph_names_the_pass() {
        let mut manager = GraphTransformerManager::default();
        manager.register(TransformerLevel::Basic, Box::new(Breaker));
        let err = manager.apply(&mut graph(), GraphOptimizationLevel::Basic).unwrap_err();
        assert!(err.is_graph_integrity());
        assert!(err.to_string().contains("Breaker"));
    }
}
