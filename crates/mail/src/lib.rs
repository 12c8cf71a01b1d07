pub mod client;

pub use client::{MailerClient, MailerError, OutgoingMessage};
