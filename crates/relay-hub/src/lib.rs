pub mod autoplay;
pub mod config;
pub mod events;
pub mod hub;
pub mod notifier;
pub mod queue;
pub mod registry;
pub mod resolution;
pub mod session;
mod session_worker;
