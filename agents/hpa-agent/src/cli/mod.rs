//! Command line support

pub mod config;
