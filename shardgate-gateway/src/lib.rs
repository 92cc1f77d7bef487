pub mod backend;
pub mod chunker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metadata;
pub mod routes;
pub mod transfer;
pub mod verify;
