//! Temperature/humidity sensor reader: derives absolute humidity, smooths
//! both readings through a 5-sample median filter, and keeps bounded
//! history rings the plateau analyzer slides a window over.

use crate::error::Result;
use crate::model::TemperatureSensorConfig;
use crate::moonraker::MoonrakerClient;
use serde_json::Value;
use std::collections::VecDeque;
use std::rc::Rc;

const MEDIAN_WINDOW: usize = 5;

/// Streaming median over a fixed-size trailing window.
struct MedianFilter {
    window: VecDeque<f64>,
    size: usize,
}

impl MedianFilter {
    fn new(size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(size),
            size,
        }
    }

    fn update(&mut self, value: f64) -> f64 {
        if self.window.len() == self.size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }
}

pub struct SensorReader {
    moonraker: Rc<MoonrakerClient>,
    config: TemperatureSensorConfig,
    pub temperature: f64,
    pub relative_humidity: f64,
    pub absolute_humidity: f64,
    pub median_relative_humidity: f64,
    pub median_absolute_humidity: f64,
    relative_humidity_filter: MedianFilter,
    absolute_humidity_filter: MedianFilter,
    relative_humidity_ring: VecDeque<f64>,
    absolute_humidity_ring: VecDeque<f64>,
    ring_capacity: usize,
}

impl SensorReader {
    pub fn new(moonraker: Rc<MoonrakerClient>, config: TemperatureSensorConfig, plateau_duration: usize) -> Self {
        Self {
            moonraker,
            config,
            temperature: 0.0,
            relative_humidity: 0.0,
            absolute_humidity: 0.0,
            median_relative_humidity: 0.0,
            median_absolute_humidity: 0.0,
            relative_humidity_filter: MedianFilter::new(MEDIAN_WINDOW),
            absolute_humidity_filter: MedianFilter::new(MEDIAN_WINDOW),
            relative_humidity_ring: VecDeque::with_capacity(plateau_duration),
            absolute_humidity_ring: VecDeque::with_capacity(plateau_duration),
            ring_capacity: plateau_duration,
        }
    }

    pub async fn update_status(&mut self, batched: Option<&Value>) -> Result<()> {
        let status = self.read_status(batched).await?;
        self.temperature = round1(status.get("temperature").and_then(Value::as_f64).unwrap_or(self.temperature));
        self.relative_humidity = round1(status.get("humidity").and_then(Value::as_f64).unwrap_or(self.relative_humidity));
        self.absolute_humidity = absolute_humidity(self.temperature, self.relative_humidity);

        self.median_relative_humidity = self.relative_humidity_filter.update(self.relative_humidity);
        self.median_absolute_humidity = self.absolute_humidity_filter.update(self.absolute_humidity);

        push_bounded(&mut self.relative_humidity_ring, self.median_relative_humidity, self.ring_capacity);
        push_bounded(&mut self.absolute_humidity_ring, self.median_absolute_humidity, self.ring_capacity);
        Ok(())
    }

    pub fn relative_humidity_ring(&self) -> &VecDeque<f64> {
        &self.relative_humidity_ring
    }

    pub fn device_name(&self) -> &str {
        &self.config.device_name
    }

    async fn read_status(&self, batched: Option<&Value>) -> Result<Value> {
        if let Some(batched) = batched {
            return Ok(batched.get(&self.config.device_name).cloned().unwrap_or(Value::Null));
        }
        Ok(self
            .moonraker
            .query(&[&self.config.device_name])
            .await?
            .get(&self.config.device_name)
            .cloned()
            .unwrap_or(Value::Null))
    }
}

fn push_bounded(ring: &mut VecDeque<f64>, value: f64, capacity: usize) {
    if ring.len() == capacity {
        ring.pop_front();
    }
    ring.push_back(value);
}

/// Magnus/Tetens approximation: grams of water vapor per cubic meter of air.
fn absolute_humidity(temperature_c: f64, relative_humidity_pct: f64) -> f64 {
    let saturation_vapor_pressure = 6.112 * ((17.67 * temperature_c) / (temperature_c + 243.5)).exp();
    let absolute = (saturation_vapor_pressure * relative_humidity_pct * 2.1674) / (273.15 + temperature_c);
    round1(absolute)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_humidity_is_deterministic() {
        let a = absolute_humidity(25.0, 30.0);
        let b = absolute_humidity(25.0, 30.0);
        assert_eq!(a, b);
    }

    #[test]
    fn absolute_humidity_matches_known_point() {
        // 25C/30%RH: saturation pressure ~31.7 hPa, AH ~ 6.9 g/m3.
        let ah = absolute_humidity(25.0, 30.0);
        assert!((ah - 6.9).abs() < 0.2, "got {ah}");
    }

    #[test]
    fn median_filter_returns_middle_value_for_odd_window() {
        let mut filter = MedianFilter::new(5);
        for v in [1.0, 5.0, 2.0, 4.0, 3.0] {
            filter.update(v);
        }
        assert_eq!(filter.update(3.0), 3.0);
    }

    #[test]
    fn ring_stays_bounded_at_capacity() {
        let mut ring = VecDeque::new();
        for i in 0..10 {
            push_bounded(&mut ring, i as f64, 3);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![7.0, 8.0, 9.0]);
    }
}
