pub mod analytics;
pub mod api;
pub mod app;
pub mod auth;
pub mod billing;
pub mod cache;
pub mod config;
pub mod kv;
pub mod links;
pub mod minter;
pub mod models;
pub mod persister;
pub mod queue;
pub mod redirect;
pub mod storage;
pub mod timeseries;
