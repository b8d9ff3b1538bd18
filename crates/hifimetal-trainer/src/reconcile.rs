//! Checkpoint reconciliation against the current architecture.
//!
//! A checkpoint written by an older architecture can still seed a new one:
//! every tensor whose name and shape still match is kept, everything else is
//! replaced by the freshly initialized value or dropped. Whenever something
//! had to change, the saved optimizer moments no longer line up with the
//! parameters and must be discarded by the caller.

use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use mlx_rs::Array;
use serde::Serialize;

/// A parameter whose saved shape differs from the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapeChange {
    pub key: String,
    pub loaded: Vec<i32>,
    pub current: Vec<i32>,
}

/// What reconciliation did, key by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Saved keys the current model does not have.
    pub dropped: Vec<String>,
    /// Shared keys replaced by the current value.
    pub shape_mismatched: Vec<ShapeChange>,
    /// Current keys absent from the checkpoint, left at their initial value.
    pub missing: Vec<String>,
    /// Shared keys loaded as saved.
    pub kept: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty() && self.shape_mismatched.is_empty() && self.missing.is_empty()
    }
}

/// Result of reconciling a saved state with the current model.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// State to load: every current key, saved value where compatible.
    pub state: HashMap<Rc<str>, Array>,
    /// Whether any saved tensor was dropped or replaced.
    pub changed: bool,
    pub report: ReconcileReport,
}

/// Reconcile a loaded state against the current model's state.
///
/// Keys present in both with equal shape keep the loaded value. Keys present
/// in both with different shape take the current value and set `changed`.
/// Loaded-only keys are dropped and set `changed`. Current-only keys keep the
/// current value and are reported as missing without setting `changed`.
pub fn reconcile<A: Borrow<Array>>(
    loaded: HashMap<Rc<str>, Array>,
    current: &HashMap<Rc<str>, A>,
) -> Reconciliation {
    let loaded_keys: BTreeSet<&Rc<str>> = loaded.keys().collect();
    let current_keys: BTreeSet<&Rc<str>> = current.keys().collect();

    let mut report = ReconcileReport::default();
    let mut state = HashMap::with_capacity(current.len());

    for key in loaded_keys.difference(&current_keys) {
        tracing::info!(key = %key, "Dropping parameter");
        report.dropped.push(key.to_string());
    }

    for key in current_keys.difference(&loaded_keys) {
        tracing::info!(key = %key, "Parameter missing from checkpoint, keeping initialized value");
        report.missing.push(key.to_string());
        state.insert(Rc::clone(key), current[*key].borrow().clone());
    }

    for key in loaded_keys.intersection(&current_keys) {
        let saved = &loaded[*key];
        let fresh = current[*key].borrow();
        if saved.shape() == fresh.shape() {
            report.kept += 1;
            state.insert(Rc::clone(key), saved.clone());
        } else {
            tracing::info!(
                key = %key,
                required = ?fresh.shape(),
                loaded = ?saved.shape(),
                "Skip loading parameter"
            );
            report.shape_mismatched.push(ShapeChange {
                key: key.to_string(),
                loaded: saved.shape().to_vec(),
                current: fresh.shape().to_vec(),
            });
            state.insert(Rc::clone(key), fresh.clone());
        }
    }

    let changed = !report.dropped.is_empty() || !report.shape_mismatched.is_empty();
    if changed {
        tracing::info!(
            dropped = report.dropped.len(),
            shape_mismatched = report.shape_mismatched.len(),
            "Checkpoint differs from architecture, optimizer state will be discarded"
        );
    }

    Reconciliation {
        state,
        changed,
        report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(shape: &[i32], value: f32) -> Array {
        let size: i32 = shape.iter().product();
        Array::from_slice(&vec![value; size as usize], shape)
    }

    fn map(entries: Vec<(&str, Array)>) -> HashMap<Rc<str>, Array> {
        entries.into_iter().map(|(k, v)| (Rc::from(k), v)).collect()
    }

    fn first_value(a: &Array) -> f32 {
        let flat = a.reshape(&[-1]).unwrap();
        flat.eval().unwrap();
        flat.as_slice::<f32>()[0]
    }

    #[test]
    fn test_identical_state_is_clean() {
        let loaded = map(vec![("a", tensor(&[2, 2], 1.0))]);
        let current = map(vec![("a", tensor(&[2, 2], 0.0))]);
        let result = reconcile(loaded, &current);

        assert!(!result.changed);
        assert!(result.report.is_clean());
        assert_eq!(result.report.kept, 1);
        assert_eq!(first_value(&result.state["a"]), 1.0);
    }

    #[test]
    fn test_shape_change_takes_current() {
        let loaded = map(vec![("w", tensor(&[128, 256], 1.0))]);
        let current = map(vec![("w", tensor(&[128, 512], 0.0))]);
        let result = reconcile(loaded, &current);

        assert!(result.changed);
        assert_eq!(result.state["w"].shape(), &[128, 512]);
        assert_eq!(first_value(&result.state["w"]), 0.0);
        assert_eq!(
            result.report.shape_mismatched,
            vec![ShapeChange {
                key: "w".into(),
                loaded: vec![128, 256],
                current: vec![128, 512],
            }]
        );
    }

    #[test]
    fn test_loaded_only_is_dropped() {
        let loaded = map(vec![("a", tensor(&[1], 1.0)), ("old", tensor(&[3], 1.0))]);
        let current = map(vec![("a", tensor(&[1], 0.0))]);
        let result = reconcile(loaded, &current);

        assert!(result.changed);
        assert!(!result.state.contains_key("old"));
        assert_eq!(result.report.dropped, vec!["old".to_string()]);
    }

    #[test]
    fn test_current_only_is_missing_but_unchanged() {
        let loaded = map(vec![("a", tensor(&[1], 1.0))]);
        let current = map(vec![("a", tensor(&[1], 0.0)), ("new", tensor(&[2], 5.0))]);
        let result = reconcile(loaded, &current);

        assert!(!result.changed);
        assert_eq!(result.report.missing, vec!["new".to_string()]);
        assert_eq!(first_value(&result.state["new"]), 5.0);
    }

    #[test]
    fn test_idempotent() {
        let loaded = map(vec![
            ("a", tensor(&[2], 1.0)),
            ("b", tensor(&[4], 1.0)),
            ("gone", tensor(&[1], 1.0)),
        ]);
        let current = map(vec![
            ("a", tensor(&[2], 0.0)),
            ("b", tensor(&[5], 0.0)),
            ("c", tensor(&[1], 0.0)),
        ]);

        let once = reconcile(loaded, &current);
        let twice = reconcile(once.state.clone(), &current);

        assert!(!twice.changed);
        assert!(twice.report.is_clean());
        assert_eq!(once.state.len(), twice.state.len());
        for (key, value) in &once.state {
            assert_eq!(value.shape(), twice.state[key].shape());
            assert_eq!(first_value(value), first_value(&twice.state[key]));
        }
    }

    #[test]
    fn test_accepts_borrowed_current() {
        let owned = map(vec![("a", tensor(&[1], 0.0))]);
        let borrowed: HashMap<Rc<str>, &Array> =
            owned.iter().map(|(k, v)| (k.clone(), v)).collect();
        let result = reconcile(map(vec![("a", tensor(&[1], 2.0))]), &borrowed);
        assert_eq!(first_value(&result.state["a"]), 2.0);
    }
}
