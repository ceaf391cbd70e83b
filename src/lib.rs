//! voprobe: timing and result statistics for VO cone search and TAP services

pub mod cli;
pub mod cone;
pub mod config;
pub mod coords;
pub mod error;
pub mod http;
pub mod input;
pub mod metrics;
pub mod models;
pub mod plugins;
pub mod query;
pub mod request;
pub mod runner;
pub mod state;
pub mod stats;
pub mod tap;
pub mod votable;
pub mod writers;
