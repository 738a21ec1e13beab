pub mod audio;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod station;
pub mod tower;
