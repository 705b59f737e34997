pub mod auth;
pub mod broadcast;
pub mod builder;
pub mod cache;
pub mod channel;
pub mod condition;
pub mod config;
pub mod convert;
pub mod logger;
pub mod output;
pub mod pattern;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod rule;
pub mod schema;
pub mod secret;
pub mod storage;
pub mod stream;
pub mod subscribe;

pub use stream_frame as frame;
