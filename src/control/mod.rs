//! Control logic: PID loops, plateau detection, and the per-dryer state
//! machine that composes them with the hardware drivers.

pub mod dryer;
pub mod pid;
pub mod plateau;
