//! Parameter Extraction Module
//!
//! Utilities for pulling typed values out of the generic
//! `HashMap<String, serde_json::Value>` a [`crate::config::types::StageSpec`]
//! carries in its `parameters` field.

use crate::config::field::FieldConfig;
use std::collections::HashMap;

/// Extracts a typed parameter, falling back to `default` if the key is
/// absent or fails to deserialise into `T`.
pub fn extract_param<T>(
    params: &Option<HashMap<String, serde_json::Value>>,
    key: &str,
    default: T,
) -> T
where
    T: serde::de::DeserializeOwned + Clone,
{
    params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(default)
}

/// Detects the field-mapping pattern present in a parameter map, trying
/// `field_in`/`field_out`, then `field_out` alone, then the `fields_in[]`/
/// `fields_out[]` parallel-array form, then an explicit `field_mapping`.
pub fn extract_field_params(params: &Option<HashMap<String, serde_json::Value>>) -> FieldConfig {
    if let (Some(field_in), Some(field_out)) = (
        extract_param(params, "field_in", None::<String>),
        extract_param(params, "field_out", None::<String>),
    ) {
        return FieldConfig::Single {
            input: field_in,
            output: field_out,
        };
    }

    if let Some(field_out) = extract_param(params, "field_out", None::<String>) {
        return FieldConfig::OutputOnly(field_out);
    }

    if let (Some(fields_in), Some(fields_out)) = (
        extract_param(params, "fields_in", None::<Vec<String>>),
        extract_param(params, "fields_out", None::<Vec<String>>),
    ) {
        if fields_in.len() == fields_out.len() {
            return FieldConfig::Multiple {
                inputs: fields_in,
                outputs: fields_out,
            };
        }
        tracing::warn!("fields_in and fields_out have different lengths, ignoring field config");
    }

    if let Some(mapping) = extract_param(params, "field_mapping", None::<HashMap<String, String>>) {
        return FieldConfig::Mapping(mapping);
    }

    FieldConfig::None
}
