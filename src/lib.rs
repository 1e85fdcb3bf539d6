pub mod adapters;
pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod geocode;
pub mod jobs;
pub mod model;
pub mod oauth;
pub mod store;
