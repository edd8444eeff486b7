pub mod checkpoint;
pub mod combine;
pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod presets;
pub mod runner;
pub mod schedule;
pub mod stage;
pub mod submission;
pub mod telemetry;
