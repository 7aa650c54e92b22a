//! Terminal input for keys, passwords and confirmations.
//!
//! On a TTY secrets are read with hidden prompts. Otherwise each secret is
//! one line of stdin, which lets scripts pipe keys in.

use crate::error::{KeychainError, Result};
use crate::storable::{KeyProvider, KeyPurpose};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::BufRead;
use std::time::Duration;
use zeroize::Zeroizing;

/// Reads secrets and answers from the user.
pub struct Prompter {
    interactive: bool,
}

impl Default for Prompter {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompter {
    /// Detect whether stdin and stdout are a terminal.
    pub fn new() -> Self {
        Self {
            interactive: atty::is(atty::Stream::Stdin) && atty::is(atty::Stream::Stdout),
        }
    }

    /// Read one secret.
    pub fn secret(&mut self, prompt: &str) -> Result<Zeroizing<String>> {
        if self.interactive {
            let value = rpassword::prompt_password(format!("{prompt}: "))?;
            return Ok(Zeroizing::new(value));
        }

        let mut line = Zeroizing::new(String::new());
        let read = std::io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Err(KeychainError::Other(format!("{prompt}: no input on stdin")));
        }
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(line)
    }

    /// Read a new secret, asking twice on a terminal.
    pub fn new_secret(&mut self, prompt: &str) -> Result<Zeroizing<String>> {
        let first = self.secret(prompt)?;
        if self.interactive {
            let second = self.secret("Confirm")?;
            if *first != *second {
                return Err(KeychainError::Other("Entries do not match".to_string()));
            }
        }
        Ok(first)
    }

    /// Ask a yes/no question. Non-interactive sessions get the default.
    pub fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        if !self.interactive {
            return Ok(default);
        }
        Confirm::new()
            .with_prompt(prompt)
            .default(default)
            .interact()
            .map_err(|e| KeychainError::Other(e.to_string()))
    }

    /// Spinner shown while a slow operation such as key derivation runs.
    pub fn spinner(&self, message: &str) -> ProgressBar {
        if !self.interactive {
            return ProgressBar::hidden();
        }
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
            spinner.set_style(style);
        }
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner
    }
}

impl KeyProvider for Prompter {
    fn key_for(&mut self, chain_name: &str, purpose: KeyPurpose) -> Result<String> {
        let key = match purpose {
            KeyPurpose::Local => self.secret(&format!("Key for chain '{chain_name}'"))?,
            KeyPurpose::Storable => {
                self.secret(&format!("Key of chain '{chain_name}' in the import file"))?
            }
            KeyPurpose::New => self.new_secret(&format!("New key for chain '{chain_name}'"))?,
        };
        Ok(key.to_string())
    }
}
