//! Telegram Bot API collaborator for the mirror engine.

mod api;
mod intake;
mod transport;

pub use api::classify;
pub use intake::TelegramIntake;
pub use transport::{TELEGRAM_API_BASE, TelegramTransport};
