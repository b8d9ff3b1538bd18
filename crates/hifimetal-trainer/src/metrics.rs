//! Running-mean metric accumulator.

use hifimetal_core::MetricReducer;

use crate::Result;

/// Running mean of scalar observations, reducible across processes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeanMetric {
    sum: f64,
    count: f64,
}

impl MeanMetric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one observation with weight 1.
    pub fn update(&mut self, value: f64) {
        self.update_weighted(value, 1.0);
    }

    /// Add one observation with the given weight. Non-finite values are ignored.
    pub fn update_weighted(&mut self, value: f64, weight: f64) {
        if !value.is_finite() || !weight.is_finite() || weight <= 0.0 {
            tracing::debug!(value, weight, "Ignoring metric observation");
            return;
        }
        self.sum += value * weight;
        self.count += weight;
    }

    /// Mean over all processes, `None` when nothing was observed anywhere.
    pub fn compute(&self, reducer: &dyn MetricReducer) -> Result<Option<f64>> {
        let reduced = reducer.all_reduce_sum(&[self.sum, self.count])?;
        let (sum, count) = match reduced.as_slice() {
            [sum, count] => (*sum, *count),
            other => {
                return Err(hifimetal_core::CoreError::Reduce(format!(
                    "expected 2 reduced values, got {}",
                    other.len()
                ))
                .into())
            }
        };
        Ok((count > 0.0).then(|| sum / count))
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Local observation weight.
    pub fn count(&self) -> f64 {
        self.count
    }
}
