pub mod auth;
pub mod configuration;
pub mod domain;
pub mod error;
pub mod logger;
pub mod middleware;
pub mod routes;
pub mod session;
pub mod startup;
pub mod storage;
pub mod telemetry;
pub mod validators;
