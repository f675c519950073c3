//! Seeded end-to-end simulation of the kernel

mod simulator;

pub use simulator::{run_simulator, SimulatorConfig, SimulatorReport, SimulatorStats, Violation};
