//! Weight Overlay (C3)
//!
//! Given a parsed datafile and the current counter state, produces a
//! datafile whose variant weights reflect the optimizer's current state,
//! without mutating the datafile cache (spec §4.3). Pure function of its
//! inputs: same datafile + same counters → same output.

use std::collections::HashMap;

use serde_json::Value;

use crate::datafile::Datafile;
use crate::types::{CounterSnapshot, VARIATIONS_KEY};

/// Rewrite `datafile`'s variant weights using `counters`, a lookup from
/// `(feature, variant_value)` to the stored snapshot for that variant.
/// Missing entries fall back to the datafile's own declared weight.
pub fn overlay(datafile: &Datafile, counters: &HashMap<(String, String), CounterSnapshot>) -> Value {
    let mut root = datafile.root.clone();

    let Some(features) = root.get_mut("features").and_then(Value::as_object_mut) else {
        return root;
    };

    for (feature_key, feature_val) in features.iter_mut() {
        let Some(variations) = feature_val
            .get_mut(VARIATIONS_KEY)
            .and_then(Value::as_array_mut)
        else {
            continue;
        };

        let original_sum: f64 = variations
            .iter()
            .filter_map(|v| v.get("weight").and_then(Value::as_f64))
            .sum();

        // Resolve each variant's effective weight: stored if present, else
        // the datafile's own declared weight.
        let mut any_stored = false;
        let mut effective: Vec<f64> = Vec::with_capacity(variations.len());
        for v in variations.iter() {
            let Some(value) = v.get("value").and_then(Value::as_str) else {
                effective.push(0.0);
                continue;
            };
            let original = v.get("weight").and_then(Value::as_f64).unwrap_or(0.0);
            match counters.get(&(feature_key.clone(), value.to_string())) {
                Some(snap) if snap.weight.is_some() => {
                    any_stored = true;
                    effective.push(snap.weight.unwrap());
                }
                _ => effective.push(original),
            }
        }

        if !any_stored {
            // All variants used their originals: output equals input.
            continue;
        }

        let effective_sum: f64 = effective.iter().sum();
        let scale = if effective_sum > 0.0 {
            original_sum / effective_sum
        } else {
            0.0
        };

        for (v, w) in variations.iter_mut().zip(effective.iter()) {
            if let Some(obj) = v.as_object_mut() {
                obj.insert("weight".to_string(), serde_json::json!(w * scale));
            }
        }
    }

    root
}
