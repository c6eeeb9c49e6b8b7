//! Addressable LED strip driver: owns per-pixel color state and diff-writes
//! G-code only when a pixel's brightness-scaled color actually changes.

use crate::error::Result;
use crate::model::LedConfig;
use crate::moonraker::{MoonrakerClient, strip_scope_prefix};
use serde_json::Value;
use std::rc::Rc;

/// Dim, near-black placeholder color used when a pixel has no active signal.
pub const DEFAULT_COLOR: (f64, f64, f64) = (0.01, 0.01, 0.01);
pub const OFF_COLOR: (f64, f64, f64) = (0.0, 0.0, 0.0);

struct Pixel {
    /// 1-indexed, matching the `INDEX=` gcode field.
    index: usize,
    red: f64,
    green: f64,
    blue: f64,
}

pub struct LedDriver {
    moonraker: Rc<MoonrakerClient>,
    config: LedConfig,
    pixels: Vec<Pixel>,
}

impl LedDriver {
    pub fn new(moonraker: Rc<MoonrakerClient>, config: LedConfig) -> Self {
        Self {
            moonraker,
            config,
            pixels: Vec::new(),
        }
    }

    pub async fn update_status(&mut self, batched: Option<&Value>) -> Result<()> {
        self.ensure_initialized().await?;
        self.pixels = self.read_pixels(batched).await?;
        Ok(())
    }

    pub fn device_name(&self) -> &str {
        &self.config.device_name
    }

    /// Scales `(r, g, b)` by the strip's brightness and, only if the result
    /// differs from the pixel's currently held color, emits `SET_LED`.
    pub async fn set_pixel_color(&mut self, index: usize, red: f64, green: f64, blue: f64) -> Result<()> {
        self.ensure_initialized().await?;
        let brightness = self.config.brightness as f64 / 100.0;
        let (red, green, blue) = (red * brightness, green * brightness, blue * brightness);
        let target_index = index + 1;

        let Some(pixel) = self.pixels.iter_mut().find(|p| p.index == target_index) else {
            return Ok(());
        };
        if pixel.red == red && pixel.green == green && pixel.blue == blue {
            return Ok(());
        }
        pixel.red = red;
        pixel.green = green;
        pixel.blue = blue;

        let name = strip_scope_prefix(&self.config.device_name);
        let gcode = format!("SET_LED LED={name} INDEX={target_index} RED={red} GREEN={green} BLUE={blue}");
        self.moonraker.gcode(&gcode).await?;
        Ok(())
    }

    async fn ensure_initialized(&mut self) -> Result<()> {
        if self.pixels.is_empty() {
            self.pixels = self.read_pixels(None).await?;
            for pixel in &mut self.pixels {
                pixel.red = DEFAULT_COLOR.0;
                pixel.green = DEFAULT_COLOR.1;
                pixel.blue = DEFAULT_COLOR.2;
            }
            let name = strip_scope_prefix(&self.config.device_name);
            let (r, g, b) = DEFAULT_COLOR;
            for pixel in &self.pixels {
                let gcode = format!("SET_LED LED={name} INDEX={} RED={r} GREEN={g} BLUE={b}", pixel.index);
                self.moonraker.gcode(&gcode).await?;
            }
        }
        Ok(())
    }

    async fn read_pixels(&self, batched: Option<&Value>) -> Result<Vec<Pixel>> {
        let color_data = if let Some(batched) = batched {
            batched
                .get(&self.config.device_name)
                .and_then(|v| v.get("color_data"))
                .cloned()
        } else {
            self.moonraker
                .query(&[&self.config.device_name])
                .await?
                .get(&self.config.device_name)
                .and_then(|v| v.get("color_data"))
                .cloned()
        };
        let Some(Value::Array(rows)) = color_data else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let rgb = row.as_array();
                let get = |pos: usize| rgb.and_then(|a| a.get(pos)).and_then(Value::as_f64).unwrap_or(0.0);
                Pixel {
                    index: i + 1,
                    red: get(0),
                    green: get(1),
                    blue: get(2),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brightness_scaling_matches_half_percent() {
        let brightness = 50.0_f64 / 100.0;
        assert_eq!(1.0 * brightness, 0.5);
    }
}
