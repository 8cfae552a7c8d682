pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod openapi;
pub mod registry;
pub mod routes;
pub mod state;
