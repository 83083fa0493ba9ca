//! Configuration Loader Module
//!
//! Loads a [`PipelineDefinition`] from TOML, the thin CLI-facing layer that
//! turns a declarative file into builder calls (see `main.rs`). This layer
//! owns no pipeline semantics of its own.

use crate::config::types::{PipelineDefinition, StageSpec};
use crate::config::validation::validate_definition;
use std::fs;
use std::path::Path;

pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<PipelineDefinition> {
    let content = fs::read_to_string(path)?;
    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> anyhow::Result<PipelineDefinition> {
    let def: PipelineDefinition = toml::from_str(content)?;
    validate_definition(&def)?;
    Ok(def)
}

/// A minimal three-stage chain (`source -> upper -> sink`), used by the
/// binary when no `--config` file is supplied and by tests as a known-good
/// starting definition.
pub fn default_config() -> PipelineDefinition {
    use std::collections::HashMap;

    let mut stages = HashMap::new();
    stages.insert(
        "source".to_string(),
        StageSpec {
            kind: "passthrough".to_string(),
            parameters: None,
        },
    );
    stages.insert(
        "upper".to_string(),
        StageSpec {
            kind: "map".to_string(),
            parameters: None,
        },
    );
    stages.insert(
        "sink".to_string(),
        StageSpec {
            kind: "passthrough".to_string(),
            parameters: None,
        },
    );

    let mut edges = HashMap::new();
    edges.insert("source".to_string(), vec!["upper".to_string()]);
    edges.insert("upper".to_string(), vec!["sink".to_string()]);

    PipelineDefinition {
        stages,
        edges,
        runtime: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let def = default_config();
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn load_from_str_round_trips_default_shape() {
        let toml = r#"
            [stages.source]
            type = "passthrough"

            [stages.sink]
            type = "passthrough"

            [edges]
            source = ["sink"]
        "#;
        let def = load_config_from_str(toml).unwrap();
        assert_eq!(def.stages.len(), 2);
        assert_eq!(def.edges.get("source").unwrap(), &vec!["sink".to_string()]);
    }
}
