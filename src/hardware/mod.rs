//! Hardware drivers: one module per subsystem, each a thin stateful wrapper
//! over the Moonraker client. None of these know about presets, phases, or
//! PID - that orchestration lives in `crate::control`.

pub mod heater;
pub mod led;
pub mod sensor;
pub mod servo;
