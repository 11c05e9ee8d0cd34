//! Respiratory / cardiac phase signal.
//!
//! One phase value in `[0, 1)` per projection. The motion-resolved operators
//! turn it into interpolation weights that spread each projection over the
//! two reconstruction phases bracketing it.

use ndarray::Array2;

use crate::error::{ReconError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSignal {
    phases: Vec<f64>,
}

impl PhaseSignal {
    /// Validate that every phase is finite and in `[0, 1)`.
    pub fn new(phases: Vec<f64>) -> Result<Self> {
        if let Some((i, p)) = phases
            .iter()
            .enumerate()
            .find(|(_, p)| !(p.is_finite() && **p >= 0.0 && **p < 1.0))
        {
            return Err(ReconError::parameter(format!(
                "phase {} of projection {} is outside [0, 1)",
                p, i
            )));
        }
        Ok(Self { phases })
    }

    /// Parse a CSV phase file: one value per projection, separated by commas,
    /// whitespace or newlines. Empty fields are ignored.
    pub fn parse_csv(text: &str) -> Result<Self> {
        let phases = text
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|field| !field.is_empty())
            .map(|field| {
                field.parse::<f64>().map_err(|e| {
                    ReconError::parameter(format!("cannot parse phase {:?}: {}", field, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(phases)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn phases(&self) -> &[f64] {
        &self.phases
    }

    /// Interpolation weights `[n_phases, n_projections]`.
    ///
    /// Reconstruction phase `p` sits at signal value `p / n_phases`. A
    /// projection at `s` contributes to `floor(s·n)` and the next phase
    /// (cyclically) with linear weights, so every column sums to one.
    pub fn interpolation_weights(&self, n_phases: usize) -> Result<Array2<f32>> {
        if n_phases == 0 {
            return Err(ReconError::parameter("at least one phase is required"));
        }
        let mut weights = Array2::<f32>::zeros((n_phases, self.phases.len()));
        for (proj, &s) in self.phases.iter().enumerate() {
            let position = s * n_phases as f64;
            let lower = (position.floor() as usize).min(n_phases - 1);
            let upper = (lower + 1) % n_phases;
            let t = (position - lower as f64) as f32;
            weights[[lower, proj]] += 1.0 - t;
            weights[[upper, proj]] += t;
        }
        Ok(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv() {
        let signal = PhaseSignal::parse_csv("0.0, 0.25\n0.5;0.75\n\n").unwrap();
        assert_eq!(signal.phases(), &[0.0, 0.25, 0.5, 0.75]);
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(matches!(
            PhaseSignal::parse_csv("0.2 1.0"),
            Err(ReconError::InvalidParameter(_))
        ));
        assert!(PhaseSignal::parse_csv("0.2 abc").is_err());
        assert!(PhaseSignal::new(vec![f64::NAN]).is_err());
    }

    #[test]
    fn test_interpolation_weights() {
        let signal = PhaseSignal::new(vec![0.0, 0.125, 0.9]).unwrap();
        let w = signal.interpolation_weights(4).unwrap();
        assert_eq!(w.column(0).to_vec(), vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(w.column(1).to_vec(), vec![0.5, 0.5, 0.0, 0.0]);
        // wraps from the last phase back to the first
        assert!((w[[3, 2]] - 0.4).abs() < 1e-6);
        assert!((w[[0, 2]] - 0.6).abs() < 1e-6);
        for col in w.columns() {
            assert!((col.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_single_phase_takes_everything() {
        let signal = PhaseSignal::new(vec![0.3, 0.7]).unwrap();
        let w = signal.interpolation_weights(1).unwrap();
        assert_eq!(w.shape(), &[1, 2]);
        assert!(w.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }
}
