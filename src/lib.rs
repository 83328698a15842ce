pub mod api;
pub mod backend;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod models;
pub mod observability;
pub mod runtime;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;
