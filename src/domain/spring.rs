// Motion smoothing for displayed sensor values
use serde::Deserialize;

/// Multiplier applied to the per-step displacement.
const DISPLACEMENT_SCALE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SpringParams {
    #[serde(default = "default_stiffness")]
    pub stiffness: f64,
    #[serde(default = "default_damping")]
    pub damping: f64,
    #[serde(default = "default_precision")]
    pub precision: f64,
}

fn default_stiffness() -> f64 {
    0.14
}

fn default_damping() -> f64 {
    0.82
}

fn default_precision() -> f64 {
    0.001
}

impl Default for SpringParams {
    fn default() -> Self {
        Self {
            stiffness: default_stiffness(),
            damping: default_damping(),
            precision: default_precision(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpringState {
    pub displayed: f64,
    pub velocity: f64,
}

impl SpringState {
    /// A spring at rest on `value`.
    pub fn at(value: f64) -> Self {
        Self {
            displayed: value,
            velocity: 0.0,
        }
    }

    pub fn is_settled_on(&self, target: f64) -> bool {
        self.displayed == target && self.velocity == 0.0
    }

    /// Advance one step of `dt` frames toward `target`.
    ///
    /// Snaps onto the target once both the remaining distance and the
    /// velocity drop below `params.precision`. Returns true when settled.
    pub fn step(&mut self, target: f64, dt: f64, params: &SpringParams) -> bool {
        if dt > 0.0 {
            let force = (target - self.displayed) * params.stiffness;
            self.velocity = (self.velocity + force * dt) * params.damping.powf(dt);
            self.displayed += self.velocity * dt * DISPLACEMENT_SCALE;
        }

        if (target - self.displayed).abs() < params.precision
            && self.velocity.abs() < params.precision
        {
            self.displayed = target;
            self.velocity = 0.0;
            return true;
        }
        false
    }
}
