//! Label selector evaluation

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::error::{Error, Result};

/// Check that every requirement of the selector can be evaluated
pub fn validate_selector(selector: &LabelSelector) -> Result<()> {
    for requirement in selector.match_expressions.iter().flatten() {
        let values = requirement.values.as_deref().unwrap_or_default();
        match requirement.operator.as_str() {
            "In" | "NotIn" if values.is_empty() => {
                return Err(Error::validation(format!(
                    "selector requirement on {:?}: operator {} needs at least one value",
                    requirement.key, requirement.operator
                )));
            }
            "Exists" | "DoesNotExist" if !values.is_empty() => {
                return Err(Error::validation(format!(
                    "selector requirement on {:?}: operator {} takes no values",
                    requirement.key, requirement.operator
                )));
            }
            "In" | "NotIn" | "Exists" | "DoesNotExist" => {}
            other => {
                return Err(Error::validation(format!(
                    "selector requirement on {:?}: unsupported operator {:?}",
                    requirement.key, other
                )));
            }
        }
    }
    Ok(())
}

/// Whether the labels satisfy the selector. An empty selector matches
/// everything.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool> {
    validate_selector(selector)?;

    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    if !labels_match {
        return Ok(false);
    }

    Ok(selector
        .match_expressions
        .iter()
        .flatten()
        .all(|r| requirement_matches(r, labels)))
}

fn requirement_matches(requirement: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&requirement.key);
    let values = requirement.values.as_deref().unwrap_or_default();
    match requirement.operator.as_str() {
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => value.map_or(true, |v| !values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        _ => false,
    }
}
