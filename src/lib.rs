#[macro_use]
extern crate tracing;

pub mod config;
pub mod constants;
pub mod context;
pub mod errors;
pub mod events;
pub mod http;
pub mod kubernetes;
pub mod models;
pub mod registry;
pub mod services;
pub mod unit_conversion;
