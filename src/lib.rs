pub mod api;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod flow;
pub mod logger;
pub mod message;
pub mod node;
pub mod nodes;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod sandbox;
pub mod schema;
pub mod signal;
pub mod state;
pub mod store;
