//! Persistent growth and remodeling state of the vessel wall.

use serde::{Deserialize, Serialize};

use crate::config::GrowthParams;
use crate::interface::{Field, InterfaceError, InterfaceState};

/// Solid quantities that persist across time steps.
///
/// Only the orchestrator mutates this state, and only between time steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GrowthState {
    /// Simulated growth time.
    pub time: f64,
    /// Number of committed time steps.
    pub steps: usize,
    /// Time increment of the step being solved.
    #[serde(default)]
    pub dt: f64,
    /// Relative mass per interface node.
    pub mass_fraction: Vec<f64>,
    /// Wall shear stress stimulus of the last committed step per node.
    pub stimulus: Vec<f64>,
    /// Homeostatic wall shear stress per node, captured at the first committed step.
    pub homeostatic: Option<Vec<f64>>,
    /// Mean stimulus of every committed step.
    pub stimulus_history: Vec<f64>,
}

impl GrowthState {
    pub fn new(num_nodes: usize) -> Self {
        GrowthState {
            time: 0.0,
            steps: 0,
            dt: 0.0,
            mass_fraction: vec![1.0; num_nodes],
            stimulus: vec![0.0; num_nodes],
            homeostatic: None,
            stimulus_history: Vec::new(),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.mass_fraction.len()
    }

    /// Evolves the state with the converged interface of one time step of length `dt`.
    ///
    /// The stimulus is the relative deviation of wall shear stress from its homeostatic value,
    /// and mass is produced or removed exponentially in proportion to it.
    pub fn commit(
        &mut self,
        converged: &InterfaceState,
        params: &GrowthParams,
        dt: f64,
    ) -> Result<(), InterfaceError> {
        let wss = converged
            .get(Field::WallShearStress)
            .ok_or(InterfaceError::MissingField(Field::WallShearStress))?;
        if wss.len() != self.num_nodes() {
            return Err(InterfaceError::SizeMismatch {
                field: Field::WallShearStress,
                expected: self.num_nodes(),
                actual: wss.len(),
            });
        }

        let homeostatic = self
            .homeostatic
            .get_or_insert_with(|| wss.iter().copied().collect());

        for (i, &tau) in wss.iter().enumerate() {
            let tau_h = homeostatic[i];
            let s = if tau_h != 0.0 { (tau - tau_h) / tau_h } else { 0.0 };
            self.stimulus[i] = s;
            self.mass_fraction[i] *= (params.gain * s * dt).exp();
        }

        let mean = if self.stimulus.is_empty() {
            0.0
        } else {
            self.stimulus.iter().sum::<f64>() / self.stimulus.len() as f64
        };
        self.stimulus_history.push(mean);
        self.time += dt;
        self.steps += 1;
        log::debug!(
            "Growth step {} committed at t = {}: mean stimulus {:.3e}",
            self.steps,
            self.time,
            mean
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::InterfaceVector;
    use approx::assert_relative_eq;

    fn with_wss(values: Vec<f64>) -> InterfaceState {
        let mut state = InterfaceState::new(values.len());
        state
            .insert(Field::WallShearStress, InterfaceVector::from_vec(values))
            .unwrap();
        state
    }

    #[test]
    fn first_step_sets_homeostasis() {
        let params = GrowthParams { dt: 1.0, gain: 0.3 };
        let mut growth = GrowthState::new(2);
        growth.commit(&with_wss(vec![2.0, 4.0]), &params, 1.0).unwrap();
        assert_eq!(growth.homeostatic, Some(vec![2.0, 4.0]));
        assert_eq!(growth.stimulus, vec![0.0, 0.0]);
        assert_eq!(growth.mass_fraction, vec![1.0, 1.0]);
        assert_eq!(growth.steps, 1);
    }

    #[test]
    fn elevated_shear_produces_mass() {
        let params = GrowthParams { dt: 1.0, gain: 0.3 };
        let mut growth = GrowthState::new(2);
        growth.commit(&with_wss(vec![2.0, 4.0]), &params, 1.0).unwrap();
        growth.commit(&with_wss(vec![3.0, 2.0]), &params, 0.5).unwrap();
        assert_relative_eq!(growth.stimulus[0], 0.5);
        assert_relative_eq!(growth.stimulus[1], -0.5);
        assert_relative_eq!(growth.mass_fraction[0], (0.3f64 * 0.5 * 0.5).exp());
        assert!(growth.mass_fraction[1] < 1.0);
        assert_relative_eq!(growth.time, 1.5);
        assert_eq!(growth.stimulus_history.len(), 2);
    }

    #[test]
    fn missing_wss_is_an_error() {
        let mut growth = GrowthState::new(2);
        let state = InterfaceState::new(2);
        assert!(growth
            .commit(&state, &GrowthParams::default(), 1.0)
            .is_err());
        assert_eq!(growth, GrowthState::new(2));
    }
}
