pub mod auth;
pub mod config;
pub mod db;
pub mod http;
pub mod model;
pub mod scheduler;
pub mod service;
pub mod throttle;
