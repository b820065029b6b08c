//! Concrete platform adapters (C2): one module per chat/issue-tracker
//! surface, each implementing the `Adapter` trait over `reqwest` for egress
//! and the platform's native webhook format for ingress.

pub mod discord;
pub mod gchat;
pub mod github;
pub mod linear;
pub mod slack;
pub mod support;
pub mod teams;

pub use discord::DiscordAdapter;
pub use gchat::GoogleChatAdapter;
pub use github::GitHubAdapter;
pub use linear::LinearAdapter;
pub use slack::SlackAdapter;
pub use teams::TeamsAdapter;
