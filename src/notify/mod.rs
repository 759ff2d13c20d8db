//! Outbound chat delivery. The digest generator is the only caller.

pub mod discord;

pub use discord::{DiscordWebhook, Embed, EmbedField, EmbedFooter, FIELD_VALUE_LIMIT};
