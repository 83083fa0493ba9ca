//! Maps a [`crate::config::types::StageSpec`]'s `kind` string to a
//! constructor, so a TOML-loaded graph definition can be turned into live
//! `Arc<dyn Stage>` instances without the loader knowing any concrete stage
//! type. Built-ins register themselves lazily on first use; callers can
//! register more before loading a definition.

use crate::config::StageSpec;
use crate::stage::Stage;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

type StageConstructor = Box<dyn Fn(&str, &StageSpec) -> anyhow::Result<Arc<dyn Stage>> + Send + Sync>;

static STAGE_REGISTRY: OnceLock<Mutex<HashMap<String, StageConstructor>>> = OnceLock::new();

fn stage_registry() -> &'static Mutex<HashMap<String, StageConstructor>> {
    STAGE_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn ensure_builtins() {
    static INITIALIZED: OnceLock<()> = OnceLock::new();
    INITIALIZED.get_or_init(|| {
        register_stage("passthrough", |name, _spec| {
            Ok(Arc::new(crate::topology::passthrough::Passthrough::new(name)))
        });
        register_stage("map", |name, spec| {
            Ok(Arc::new(crate::topology::map::Map::new(name, spec)?))
        });
        register_stage("filter", |name, spec| {
            Ok(Arc::new(crate::topology::filter::Filter::new(name, spec)?))
        });
        register_stage("router", |name, spec| {
            Ok(Arc::new(crate::topology::router::Router::new(name, spec)?))
        });
        tracing::debug!("built-in stage kinds registered");
    });
}

/// Registers a constructor under `kind`, replacing any prior registration.
pub fn register_stage<F>(kind: &str, constructor: F)
where
    F: Fn(&str, &StageSpec) -> anyhow::Result<Arc<dyn Stage>> + Send + Sync + 'static,
{
    stage_registry()
        .lock()
        .unwrap()
        .insert(kind.to_string(), Box::new(constructor));
}

/// Constructs a stage named `name` from `spec.kind`. Fails if `spec.kind`
/// has no registered constructor or if the constructor itself rejects
/// `spec.parameters`.
pub fn create_stage(name: &str, spec: &StageSpec) -> anyhow::Result<Arc<dyn Stage>> {
    ensure_builtins();
    let registry = stage_registry().lock().unwrap();
    let constructor = registry
        .get(spec.kind.as_str())
        .ok_or_else(|| anyhow::anyhow!("unknown stage kind: {}", spec.kind))?;
    constructor(name, spec)
}

pub fn stage_exists(kind: &str) -> bool {
    ensure_builtins();
    stage_registry().lock().unwrap().contains_key(kind)
}

pub fn list_stage_kinds() -> Vec<String> {
    ensure_builtins();
    let mut kinds: Vec<String> = stage_registry().lock().unwrap().keys().cloned().collect();
    kinds.sort();
    kinds
}
