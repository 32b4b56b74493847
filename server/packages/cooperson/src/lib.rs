//! Jason Cooperson coaching chat backend.

pub mod adapter;
pub mod agent;
pub mod chat;
pub mod chatkit;
pub mod citations;
pub mod cli;
pub mod config;
pub mod conversation_cache;
pub mod data_stream;
pub mod openai;
pub mod router;
pub mod store;
