use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::InputFile;

/// Messaging collaborator. The scheduler and the ledger talk to this seam,
/// never to the bot directly.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;
    async fn send_document(&self, chat_id: i64, name: &str, bytes: Vec<u8>) -> Result<()>;
}

pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn from_env() -> Self {
        Self::new(Bot::from_env())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .context("Failed to send Telegram message")?;
        Ok(())
    }

    async fn send_document(&self, chat_id: i64, name: &str, bytes: Vec<u8>) -> Result<()> {
        let file = InputFile::memory(bytes).file_name(name.to_string());
        self.bot
            .send_document(ChatId(chat_id), file)
            .await
            .context("Failed to send Telegram document")?;
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Captures dispatched messages for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub messages: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((chat_id, text.to_string()));
            Ok(())
        }

        async fn send_document(&self, chat_id: i64, name: &str, _bytes: Vec<u8>) -> Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((chat_id, format!("document:{}", name)));
            Ok(())
        }
    }
}
