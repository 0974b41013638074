pub mod config;
pub mod constants;
pub mod error;
pub mod graph;
pub mod primitives;
pub mod state;
