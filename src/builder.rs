//! Fluent graph construction and validation.
//!
//! `Builder` accumulates stages and named edges, then `build()` performs the
//! structural checks the runtime relies on: non-empty, unique names, every
//! edge endpoint exists, and no cycle. Cycle detection is a DFS with an
//! explicit recursion stack — stack membership on a revisit is the back-edge
//! that proves a cycle.

use crate::config::types::PipelineConfig;
use crate::config::validation::validate_runtime_config;
use crate::error::BuildError;
use crate::events::EventEmitter;
use crate::pipeline::Pipeline;
use crate::stage::Stage;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct Builder {
    stages: Vec<Arc<dyn Stage>>,
    edges: HashMap<String, Vec<String>>,
    config: PipelineConfig,
    event_emitter: Option<Arc<dyn EventEmitter>>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            edges: HashMap::new(),
            config: PipelineConfig::default(),
            event_emitter: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.event_emitter = Some(emitter);
        self
    }

    pub fn add_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Add every stage in order and wire them as a linear chain
    /// `s1 -> s2 -> ... -> sN`.
    pub fn chain(mut self, stages: Vec<Arc<dyn Stage>>) -> Self {
        for window in stages.windows(2) {
            let (from, to) = (window[0].name().to_string(), window[1].name().to_string());
            self.edges.entry(from).or_default().push(to);
        }
        for stage in stages {
            self.stages.push(stage);
        }
        self
    }

    pub fn connect(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.entry(from.into()).or_default().push(to.into());
        self
    }

    pub fn branch(mut self, from: impl Into<String>, to: Vec<String>) -> Self {
        let from = from.into();
        self.edges.entry(from).or_default().extend(to);
        self
    }

    pub fn build(self) -> Result<Pipeline, BuildError> {
        if self.stages.is_empty() {
            return Err(BuildError::NoStages);
        }

        validate_runtime_config(&self.config).map_err(|e| BuildError::InvalidConfig(e.to_string()))?;

        let mut by_name: HashMap<String, Arc<dyn Stage>> = HashMap::new();
        for stage in &self.stages {
            if by_name.insert(stage.name().to_string(), stage.clone()).is_some() {
                return Err(BuildError::DuplicateStageName(stage.name().to_string()));
            }
        }

        for (from, targets) in &self.edges {
            if !by_name.contains_key(from) {
                return Err(BuildError::StageNotFound(from.clone()));
            }
            for to in targets {
                if !by_name.contains_key(to) {
                    return Err(BuildError::StageNotFound(to.clone()));
                }
            }
        }

        detect_cycle(&by_name, &self.edges)?;

        Ok(Pipeline::new(
            by_name,
            self.edges,
            self.config,
            self.event_emitter,
        ))
    }

    pub fn build_clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
            edges: self.edges.clone(),
            config: self.config.clone(),
            event_emitter: self.event_emitter.clone(),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(PartialEq, Eq)]
enum VisitState {
    Visiting,
    Done,
}

fn detect_cycle(
    stages: &HashMap<String, Arc<dyn Stage>>,
    edges: &HashMap<String, Vec<String>>,
) -> Result<(), BuildError> {
    let mut state: HashMap<&str, VisitState> = HashMap::new();

    // Stable iteration order for determinism: sort stage names, walk edges
    // in insertion order within each stage's adjacency list.
    let mut names: Vec<&str> = stages.keys().map(String::as_str).collect();
    names.sort();

    for name in names {
        if !state.contains_key(name) {
            visit(name, edges, &mut state)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    name: &'a str,
    edges: &'a HashMap<String, Vec<String>>,
    state: &mut HashMap<&'a str, VisitState>,
) -> Result<(), BuildError> {
    state.insert(name, VisitState::Visiting);

    if let Some(targets) = edges.get(name) {
        for target in targets {
            match state.get(target.as_str()) {
                Some(VisitState::Visiting) => {
                    return Err(BuildError::CyclicDependency(target.clone()));
                }
                Some(VisitState::Done) => continue,
                None => visit(target.as_str(), edges, state)?,
            }
        }
    }

    state.insert(name, VisitState::Done);
    Ok(())
}

/// DFS over an edge map alone, without stage objects — used by tests that
/// want to exercise cycle detection without constructing real stages.
#[cfg(test)]
pub(crate) fn detect_cycle_in_edges(
    names: &HashSet<String>,
    edges: &HashMap<String, Vec<String>>,
) -> Result<(), BuildError> {
    let mut state: HashMap<&str, VisitState> = HashMap::new();
    let mut sorted: Vec<&str> = names.iter().map(String::as_str).collect();
    sorted.sort();
    for name in sorted {
        if !state.contains_key(name) {
            visit(name, edges, &mut state)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::passthrough::Passthrough;
    use std::collections::HashSet;

    fn names(v: &[&str]) -> HashSet<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn build_rejects_invalid_config_even_without_loading_from_toml() {
        let mut config = PipelineConfig::default();
        config.channel_buffer_size = 0;
        config.priority_queue_enabled = false;

        let result = Builder::new()
            .with_config(config)
            .add_stage(Arc::new(Passthrough::new("p")))
            .build();

        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn linear_chain_has_no_cycle() {
        let mut edges = HashMap::new();
        edges.insert("a".to_string(), vec!["b".to_string()]);
        edges.insert("b".to_string(), vec!["c".to_string()]);
        assert!(detect_cycle_in_edges(&names(&["a", "b", "c"]), &edges).is_ok());
    }

    #[test]
    fn three_cycle_is_detected() {
        let mut edges = HashMap::new();
        edges.insert("a".to_string(), vec!["b".to_string()]);
        edges.insert("b".to_string(), vec!["c".to_string()]);
        edges.insert("c".to_string(), vec!["a".to_string()]);
        assert!(matches!(
            detect_cycle_in_edges(&names(&["a", "b", "c"]), &edges),
            Err(BuildError::CyclicDependency(_))
        ));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut edges = HashMap::new();
        edges.insert("a".to_string(), vec!["b".to_string(), "c".to_string()]);
        edges.insert("b".to_string(), vec!["d".to_string()]);
        edges.insert("c".to_string(), vec!["d".to_string()]);
        assert!(detect_cycle_in_edges(&names(&["a", "b", "c", "d"]), &edges).is_ok());
    }
}
