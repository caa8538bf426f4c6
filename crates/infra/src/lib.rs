pub mod ai;
pub mod config;
pub mod logging;
pub mod media;
pub mod notify;
pub mod repositories;
