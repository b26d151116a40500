pub mod api;
pub mod config;
pub mod directory;
pub mod event;
pub mod keys;
pub mod mapping;
pub mod middleware;
pub mod processors;
pub mod prometheus;
pub mod router;
pub mod routing;
pub mod segmentio;
pub mod server;
pub mod sinks;
pub mod time;
pub mod tracker;
pub mod transformers;
