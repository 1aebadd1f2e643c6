pub mod auth_controller;
pub mod bootstrap_controller;
pub mod cert_controller;
pub mod docker_controller;
pub mod readiness_controller;
pub mod route_controller;
pub mod topology_controller;
