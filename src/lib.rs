//! Taxi relay — classifies taxi-order chat messages and republishes them
//! to a single target channel.

pub mod channels;
pub mod config;
pub mod error;
pub mod geo;
pub mod pipeline;
pub mod rules;
pub mod store;
pub mod text;
