pub mod dashboard_handler;
pub mod entrypoint_handler;
pub mod proxy_handler;
pub mod server_handler;
