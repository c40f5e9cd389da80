pub mod capture;
pub mod commands;
pub mod config;
pub mod error;
pub mod forward;
pub mod logging;
pub mod oneshot;
pub mod proxy;
pub mod state;
pub mod tls;
pub mod tunnel;
pub mod web;
