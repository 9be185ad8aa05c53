pub mod api;
pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod monitor;
pub mod parser;
pub mod rpc;
pub mod store;
pub mod supervisor;
