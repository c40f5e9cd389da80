mod server;
mod service;

pub use server::ProxyServer;
pub use service::{is_burst_request, replay_response, ProxyService, BURST_PATH};
