//! Configuration Validation Module
//!
//! Structural graph validation (cycles, duplicate names, dangling edges)
//! lives in [`crate::builder`], since it depends on the stages actually
//! registered at build time. This module only validates the standalone,
//! stage-agnostic parts of a loaded configuration: the runtime knobs and
//! the declarative graph shape's internal consistency.

use crate::config::types::{PipelineConfig, PipelineDefinition};

pub fn validate_runtime_config(config: &PipelineConfig) -> anyhow::Result<()> {
    if config.channel_buffer_size == 0 && !config.priority_queue_enabled {
        return Err(anyhow::anyhow!(
            "channel_buffer_size must be positive unless priority_queue_enabled is set"
        ));
    }
    Ok(())
}

/// Checks that every edge source/target in a [`PipelineDefinition`] names a
/// declared stage. Builder re-derives the same check from the live stage
/// registry, but failing fast here gives a cleaner error before any stage is
/// constructed.
pub fn validate_definition(def: &PipelineDefinition) -> anyhow::Result<()> {
    validate_runtime_config(&def.runtime)?;

    if def.stages.is_empty() {
        return Err(anyhow::anyhow!("pipeline definition has no stages"));
    }

    for (from, targets) in &def.edges {
        if !def.stages.contains_key(from) {
            return Err(anyhow::anyhow!("edge source '{}' is not a declared stage", from));
        }
        for to in targets {
            if !def.stages.contains_key(to) {
                return Err(anyhow::anyhow!(
                    "edge target '{}' (from '{}') is not a declared stage",
                    to,
                    from
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::StageSpec;
    use std::collections::HashMap;

    #[test]
    fn rejects_dangling_edge() {
        let mut stages = HashMap::new();
        stages.insert(
            "a".to_string(),
            StageSpec {
                kind: "passthrough".to_string(),
                parameters: None,
            },
        );
        let mut edges = HashMap::new();
        edges.insert("a".to_string(), vec!["missing".to_string()]);

        let def = PipelineDefinition {
            stages,
            edges,
            runtime: PipelineConfig::default(),
        };

        assert!(validate_definition(&def).is_err());
    }
}
