pub mod bridge;
pub mod config;
pub mod error;
pub mod route_server;
pub mod session;
pub mod terminal;
pub mod version;
