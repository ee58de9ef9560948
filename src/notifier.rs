//! Outbound messaging seam.
//!
//! The approval core only ever talks to [`Notifier`]; the production
//! implementation sends Telegram messages, tests plug in a recorder.
use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup};
use tracing::debug;

/// Presentation extras for an outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyOptions {
    /// Callback data for a single "Done" acknowledgement button.
    pub ack_callback: Option<String>,
}

impl NotifyOptions {
    pub fn with_ack(callback: impl Into<String>) -> Self {
        Self {
            ack_callback: Some(callback.into()),
        }
    }
}

/// Fire-and-forget delivery. Callers treat every error as a lost message.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: i64, text: &str, options: NotifyOptions) -> Result<()>;
}

#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

pub fn ack_keyboard(callback: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "Done",
        callback.to_string(),
    )]])
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, recipient: i64, text: &str, options: NotifyOptions) -> Result<()> {
        let request = self.bot.send_message(ChatId(recipient), text.to_string());
        let sent = match options.ack_callback.as_deref() {
            Some(callback) => request.reply_markup(ack_keyboard(callback)).await?,
            None => request.await?,
        };
        debug!(recipient, message_id = sent.id.0, "notification delivered");
        Ok(())
    }
}
