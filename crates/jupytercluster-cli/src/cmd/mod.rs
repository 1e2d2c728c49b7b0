pub mod config;
pub mod hub;
