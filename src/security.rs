//! Clipboard handling for revealed passwords.

use crate::error::{KeychainError, Result};
use copypasta::{ClipboardContext, ClipboardProvider};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;
use zeroize::Zeroizing;

/// Clipboard manager for secure clipboard operations.
pub struct ClipboardManager;

impl ClipboardManager {
    /// Copy text to the clipboard and clear it after `timeout_secs`, unless
    /// something else was copied in the meantime. The returned handle
    /// completes once the clipboard has been checked.
    pub fn copy_with_timeout(text: &str, timeout_secs: u64) -> Result<tokio::task::JoinHandle<()>> {
        Self::copy(text)?;

        let text_to_clear = Zeroizing::new(text.to_string());
        Ok(tokio::spawn(async move {
            sleep(Duration::from_secs(timeout_secs)).await;

            if let Ok(current) = Self::get_contents() {
                let current = Zeroizing::new(current);
                if *current == *text_to_clear && Self::clear().is_ok() {
                    debug!("Cleared clipboard");
                }
            }
        }))
    }

    /// Copy text to clipboard.
    pub fn copy(text: &str) -> Result<()> {
        let mut ctx = ClipboardContext::new().map_err(|_| KeychainError::ClipboardFailed)?;

        ctx.set_contents(text.to_string())
            .map_err(|_| KeychainError::ClipboardFailed)?;

        Ok(())
    }

    /// Get clipboard contents.
    pub fn get_contents() -> Result<String> {
        let mut ctx = ClipboardContext::new().map_err(|_| KeychainError::ClipboardFailed)?;

        ctx.get_contents().map_err(|_| KeychainError::ClipboardFailed)
    }

    /// Clear clipboard.
    pub fn clear() -> Result<()> {
        Self::copy("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clipboard_operations() {
        // Needs a display server; CI runners have none
        if std::env::var("CI").is_ok() || ClipboardContext::new().is_err() {
            return;
        }

        let test_text = "test_clipboard_content";
        if ClipboardManager::copy(test_text).is_err() {
            return;
        }

        if let Ok(content) = ClipboardManager::get_contents() {
            assert_eq!(content, test_text);
        }

        assert!(ClipboardManager::clear().is_ok());
    }
}
