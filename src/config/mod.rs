///! Configuration Module

pub mod field;
pub mod loader;
pub mod params;
pub mod traits;
pub mod types;
pub mod validation;

pub use field::FieldConfig;
pub use loader::{default_config, load_config, load_config_from_str};
pub use params::{extract_field_params, extract_param};
pub use traits::StageParams;
pub use types::{ChannelType, PipelineConfig, PipelineDefinition, StageSpec};
pub use validation::{validate_definition, validate_runtime_config};
