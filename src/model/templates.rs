//! Named template merge.
//!
//! Templates are matched by name. A matched pair is merged field by field
//! over its JSON form, with the source overriding every field it sets.
//! Unmatched source templates are appended. Nothing is ever removed.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::crd::{ChiTemplates, PodTemplate, ServiceTemplate, VolumeClaimTemplate};

/// A template addressable by its unique name.
pub trait NamedTemplate: Clone + Serialize + DeserializeOwned {
    fn name(&self) -> &str;
}

impl NamedTemplate for PodTemplate {
    fn name(&self) -> &str {
        &self.name
    }
}

impl NamedTemplate for VolumeClaimTemplate {
    fn name(&self) -> &str {
        &self.name
    }
}

impl NamedTemplate for ServiceTemplate {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Merge `source` over `destination`, returning the combined set.
pub fn merge(destination: &ChiTemplates, source: &ChiTemplates) -> ChiTemplates {
    ChiTemplates {
        pod_templates: merge_named(&destination.pod_templates, &source.pod_templates),
        volume_claim_templates: merge_named(
            &destination.volume_claim_templates,
            &source.volume_claim_templates,
        ),
        service_templates: merge_named(
            &destination.service_templates,
            &source.service_templates,
        ),
    }
}

/// Merge one named list. Order of `destination` is kept, new names go last.
pub fn merge_named<T: NamedTemplate>(destination: &[T], source: &[T]) -> Vec<T> {
    let mut merged = destination.to_vec();
    for template in source {
        match merged.iter_mut().find(|t| t.name() == template.name()) {
            Some(existing) => *existing = merge_template(existing, template),
            None => merged.push(template.clone()),
        }
    }
    merged
}

/// Field-level merge of two templates sharing a name.
pub fn merge_template<T: NamedTemplate>(destination: &T, source: &T) -> T {
    let (mut base, overlay) = match (
        serde_json::to_value(destination),
        serde_json::to_value(source),
    ) {
        (Ok(base), Ok(overlay)) => (base, overlay),
        _ => return source.clone(),
    };

    merge_value(&mut base, &overlay);

    match serde_json::from_value(base) {
        Ok(merged) => merged,
        Err(e) => {
            warn!(template = %source.name(), error = %e, "Merged template is not well-formed, keeping source");
            source.clone()
        }
    }
}

/// Recursively overlay `source` onto `destination`.
///
/// Objects merge key by key. Any other set value replaces the destination,
/// arrays included.
pub fn merge_value(destination: &mut Value, source: &Value) {
    match (destination, source) {
        (Value::Object(dest), Value::Object(src)) => {
            for (key, value) in src {
                if !is_set(value) {
                    continue;
                }
                match dest.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_value(existing, value)
                    }
                    _ => {
                        dest.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dest, src) => {
            if is_set(src) {
                *dest = src.clone();
            }
        }
    }
}

fn is_set(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}
