//! PID controllers for the two control loops this crate runs per dryer:
//! a temperature->power heater PID, and a humidity->temperature-setpoint
//! PID whose output is inverted before being handed to the heater PID.
//!
//! Hand-rolled rather than pulled from a PID crate: the gains are fixed,
//! the output bounds move every tick, and the inversion in
//! [`HumidityPid`] has no equivalent in a generic PID library.

const KP: f64 = 1.0;
const KI: f64 = 0.1;
const KD: f64 = 0.05;

/// Textbook PID with clamped, per-call-adjustable output bounds. Integral
/// term is clamped to the current output bounds to avoid windup when the
/// bounds shrink between calls.
struct Pid {
    setpoint: f64,
    min: f64,
    max: f64,
    integral: f64,
    previous_error: Option<f64>,
}

impl Pid {
    fn new(setpoint: f64, min: f64, max: f64) -> Self {
        let min = min.min(max);
        Self {
            setpoint,
            min,
            max,
            integral: 0.0,
            previous_error: None,
        }
    }

    fn set_setpoint(&mut self, setpoint: f64) {
        if self.setpoint != setpoint {
            self.setpoint = setpoint;
        }
    }

    /// A degenerate config (e.g. `heater.max_temperature == 0`) can push
    /// `max` below the default `min`; clamp `min` down rather than let
    /// `f64::clamp` panic on an inverted range.
    fn set_output_limits(&mut self, min: f64, max: f64) {
        let min = min.min(max);
        if self.min != min || self.max != max {
            self.min = min;
            self.max = max;
            self.integral = self.integral.clamp(self.min, self.max);
        }
    }

    fn step(&mut self, measurement: f64) -> f64 {
        let error = self.setpoint - measurement;
        self.integral = (self.integral + error * KI).clamp(self.min, self.max);
        let derivative = match self.previous_error {
            Some(prev) => error - prev,
            None => 0.0,
        };
        self.previous_error = Some(error);
        let output = KP * error + self.integral + KD * derivative;
        output.clamp(self.min, self.max)
    }
}

/// Temperature -> heater power. Output bound floor defaults to 1 (never
/// commands a true zero through the PID path; an explicit `heater.set(0)`
/// is how callers turn the heater fully off).
pub struct HeaterPid {
    pid: Pid,
    min_temperature: f64,
    max_temperature: f64,
}

impl HeaterPid {
    pub fn new(max_temperature: f64) -> Self {
        Self {
            pid: Pid::new(0.0, 1.0, max_temperature),
            min_temperature: 1.0,
            max_temperature,
        }
    }

    /// Updates setpoint/bounds lazily (only if they actually changed).
    /// `max_temperature` is clamped to this PID's configured ceiling.
    pub fn update(&mut self, target_temperature: f64, min_temperature: Option<f64>, max_temperature: Option<f64>) {
        let min = min_temperature.unwrap_or(self.min_temperature);
        let max = match max_temperature {
            Some(m) if m <= self.max_temperature => m,
            _ => self.max_temperature,
        };
        self.pid.set_setpoint(target_temperature);
        self.pid.set_output_limits(min, max);
    }

    /// Returns power rounded to 2 decimals, in the currently configured bounds.
    pub fn get(&mut self, current_temperature: f64) -> f64 {
        round2(self.pid.step(current_temperature))
    }
}

/// Humidity -> temperature setpoint. Drives towards a target relative
/// humidity but reports its output as an inverted temperature target, so
/// callers can feed it straight into a [`HeaterPid`].
pub struct HumidityPid {
    pid: Pid,
}

impl HumidityPid {
    pub fn new(target_humidity: f64, min_temperature: f64, max_temperature: f64) -> Self {
        Self {
            pid: Pid::new(target_humidity, min_temperature, max_temperature),
        }
    }

    /// Higher humidity error maps to a *lower* inverted temperature target.
    /// A PID output saturated at its upper bound inverts to exactly `min()`
    /// - callers use that as the escape-hatch signal to fall back to the
    /// heater PID instead of commanding the degenerate setpoint directly.
    pub fn get(&mut self, current_humidity: f64) -> f64 {
        let min = self.pid.min;
        let max = self.pid.max;
        let output = self.pid.step(current_humidity);
        let target_temperature = (max - min) * ((100.0 - ((output - min) / (max - min)) * 100.0) / 100.0) + min;
        round2(target_temperature)
    }

    pub fn min(&self) -> f64 {
        self.pid.min
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heater_pid_output_stays_within_bounds() {
        let mut pid = HeaterPid::new(100.0);
        pid.update(50.0, None, Some(80.0));
        for _ in 0..20 {
            let out = pid.get(20.0);
            assert!(out >= 1.0 && out <= 80.0, "out={out}");
        }
    }

    #[test]
    fn heater_pid_max_bound_never_exceeds_configured_ceiling() {
        let mut pid = HeaterPid::new(60.0);
        pid.update(50.0, None, Some(200.0));
        let out = pid.get(10.0);
        assert!(out <= 60.0);
    }

    #[test]
    fn humidity_pid_higher_humidity_error_lowers_temperature_target() {
        let mut low_error = HumidityPid::new(10.0, 1.0, 80.0);
        let mut high_error = HumidityPid::new(10.0, 1.0, 80.0);
        let target_low_error = low_error.get(12.0);
        let target_high_error = high_error.get(40.0);
        assert!(target_high_error <= target_low_error);
    }

    #[test]
    fn degenerate_zero_max_temperature_clamps_output_to_zero() {
        let mut pid = HeaterPid::new(0.0);
        pid.update(50.0, None, None);
        assert_eq!(pid.get(20.0), 0.0);
    }

    #[test]
    fn humidity_pid_saturated_high_inverts_to_configured_min() {
        let mut pid = HumidityPid::new(10.0, 1.0, 80.0);
        // Drive the raw error hard positive for enough steps to saturate
        // the underlying PID at its upper output bound.
        let mut target = 0.0;
        for _ in 0..50 {
            target = pid.get(1000.0);
        }
        assert_eq!(target, pid.min());
    }
}
