use std::time::Duration;

/// First-order thermal model of a heated space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantParams {
    pub ambient_c: f64,
    /// Temperature the space settles at with the heater running indefinitely.
    pub heated_c: f64,
    pub time_constant_secs: f64,
}

impl Default for PlantParams {
    fn default() -> Self {
        Self {
            ambient_c: 18.0,
            heated_c: 32.0,
            time_constant_secs: 1_800.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Plant {
    params: PlantParams,
    temperature_c: f64,
    heater_on: bool,
}

impl Plant {
    pub fn new(params: PlantParams, initial_c: f64) -> Self {
        Self {
            params,
            temperature_c: initial_c,
            heater_on: false,
        }
    }

    pub fn temperature_c(&self) -> f64 {
        self.temperature_c
    }

    pub fn heater_on(&self) -> bool {
        self.heater_on
    }

    pub fn set_heater(&mut self, on: bool) {
        self.heater_on = on;
    }

    /// Advances the model by `dt` and returns the new temperature.
    pub fn step(&mut self, dt: Duration) -> f64 {
        let target = if self.heater_on {
            self.params.heated_c
        } else {
            self.params.ambient_c
        };
        let tau = self.params.time_constant_secs.max(1.0);
        let decay = (-dt.as_secs_f64() / tau).exp();
        self.temperature_c = target + (self.temperature_c - target) * decay;
        self.temperature_c
    }
}
