pub mod migrations;
pub mod tables;
pub mod users;
