pub mod api;
pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod failure;
pub mod handlers;
pub mod models;
pub mod recorder;
pub mod topology;
pub mod utils;
pub mod worker;
