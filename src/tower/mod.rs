pub mod broadcast;
pub mod drain;
pub mod encoder_manager;
pub mod events;
pub mod fallback;
pub mod http;
pub mod ingest;
pub mod pump;
pub mod service;
pub mod supervisor;
