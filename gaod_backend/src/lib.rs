//! Gaod chat back end: conversation stores, per-user memory, the generation
//! client, and the tag post-processing pipeline that resolves in-band tool
//! calls (`[UPDATE_MEMORY: ...]`, `[EXECUTE_CODE: ...]`, `[WEB_SEARCH: ...]`,
//! `[GENERATE_IMAGE: ...]`) before an assistant turn is stored.

pub mod auth;
pub mod chat;
pub mod config;
pub mod database;
pub mod http_client;
pub mod llm_client;
pub mod memory;
pub mod prompt;
pub mod rate_limit;
pub mod runtime;
pub mod security;
pub mod server;
pub mod store;
pub mod tools;
