pub mod artifacts;
pub mod bootstrap;
pub mod calibration;
pub mod config;
pub mod dataset;
pub mod error;
pub mod explain;
pub mod features;
pub mod hybrid;
pub mod limiter;
pub mod logging;
pub mod models;
pub mod outcomes;
pub mod power_rating;
pub mod stacking;
pub mod temporal;
pub mod trainer;
pub mod training_state;
