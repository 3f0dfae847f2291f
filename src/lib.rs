pub mod api;
pub mod config;
pub mod controller;
pub mod error;
/// Constraint progress and feasibility of the current run.
pub mod feasibility;
pub mod model;
pub mod persistence;
pub mod scheduler;
pub mod state;
pub mod stepper;
pub mod store;
