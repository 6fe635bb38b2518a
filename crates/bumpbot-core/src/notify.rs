use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;

/// Boundary to the chat adapter. Message formatting, attachments, and
/// channel resolution live behind this trait; the core only needs plain
/// sends plus ephemeral messages for progress notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a message to a channel or user.
    async fn send(&self, target: &str, text: &str) -> Result<()>;

    /// Post an ephemeral message; the returned id is used to update and
    /// delete it later.
    async fn post_ephemeral(&self, target: &str, text: &str) -> Result<String>;

    async fn update_ephemeral(&self, target: &str, id: &str, text: &str) -> Result<()>;

    async fn delete_ephemeral(&self, target: &str, id: &str) -> Result<()>;
}

/// Log-only notifier: used when no chat adapter is wired up (shell mode).
#[derive(Default)]
pub struct LogNotifier {
    next_id: AtomicU64,
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, target: &str, text: &str) -> Result<()> {
        info!("Would have informed channel {target} with message: {text}");
        Ok(())
    }

    async fn post_ephemeral(&self, target: &str, text: &str) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!("Would have posted ephemeral message {id} to {target}: {text}");
        Ok(id.to_string())
    }

    async fn update_ephemeral(&self, target: &str, id: &str, text: &str) -> Result<()> {
        info!("Would have updated ephemeral message {id} in {target}: {text}");
        Ok(())
    }

    async fn delete_ephemeral(&self, target: &str, id: &str) -> Result<()> {
        info!("Would have deleted ephemeral message {id} in {target}");
        Ok(())
    }
}
