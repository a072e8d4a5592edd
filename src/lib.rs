pub mod backend;
pub mod banner;
pub mod bridge;
pub mod catalog;
pub mod chat_state;
pub mod commands;
pub mod config;
pub mod consts;
pub mod error;
pub mod events;
pub mod payment;
pub mod prompts;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod spinner;
pub mod terminal;
pub mod worker;
