pub mod bootstrap_models;
pub mod dependency_target;
pub mod proxy_config_model;
pub mod route_rule;
pub mod topology_model;
pub mod user_model;
