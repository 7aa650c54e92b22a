//! Human-readable TXT storable codec.
//!
//! ```text
//! keychain-export v1 plain
//! chain: Work
//!   description: Office accounts
//!   link: Email
//!     description: Outlook
//!     password: hunter2
//! ```
//!
//! Private exports add `salt`, `kdf` and `validator` lines to each chain and
//! an `iv` line to each link. Values escape `\` as `\\` and newlines as `\n`.

use super::{Storable, StorableChain, StorableChainLink};
use crate::crypto::{EncryptedPassword, KdfParams};
use crate::error::{KeychainError, Result};

const MAGIC: &str = "keychain-export v1";

pub(super) fn encode(storable: &Storable) -> String {
    let mut out = format!(
        "{MAGIC} {}\n",
        if storable.private { "private" } else { "plain" }
    );

    for chain in &storable.chains {
        field(&mut out, 0, "chain", &chain.name);
        field(&mut out, 1, "description", &chain.description);
        if let Some(salt) = &chain.salt {
            field(&mut out, 1, "salt", salt);
        }
        if let Some(kdf) = &chain.kdf {
            let value = format!("m={};t={};p={}", kdf.memory_kib, kdf.iterations, kdf.parallelism);
            field(&mut out, 1, "kdf", &value);
        }
        if let Some(validator) = &chain.validator {
            field(
                &mut out,
                1,
                "validator",
                &format!("{} {}", validator.ciphertext, validator.iv),
            );
        }

        for link in &chain.links {
            field(&mut out, 1, "link", &link.name);
            field(&mut out, 2, "description", &link.description);
            field(&mut out, 2, "password", &link.password);
            if let Some(iv) = &link.iv {
                field(&mut out, 2, "iv", iv);
            }
        }
    }

    out
}

pub(super) fn decode(text: &str) -> Result<Storable> {
    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));

    let (_, first) = lines
        .find(|(_, l)| !l.trim().is_empty())
        .ok_or_else(|| KeychainError::storable(1, "empty TXT export"))?;
    let private = match first.trim().strip_prefix(MAGIC).map(str::trim) {
        Some("private") => true,
        Some("plain") => false,
        _ => return Err(KeychainError::storable(1, "missing keychain-export header")),
    };

    let mut storable = Storable {
        private,
        chains: Vec::new(),
    };

    for (line, raw) in lines {
        if raw.trim().is_empty() || raw.trim_start().starts_with('#') {
            continue;
        }

        let indent = raw.len() - raw.trim_start_matches(' ').len();
        let (key, value) = split_field(raw.trim_start())
            .ok_or_else(|| KeychainError::storable(line, "expected 'key: value'"))?;
        let value = unescape(value).map_err(|msg| KeychainError::storable(line, msg))?;

        match (indent, key) {
            (0, "chain") => storable.chains.push(StorableChain {
                name: value,
                description: String::new(),
                salt: None,
                kdf: None,
                validator: None,
                links: Vec::new(),
            }),
            (2, _) => {
                let chain = storable
                    .chains
                    .last_mut()
                    .ok_or_else(|| KeychainError::storable(line, "field outside of a chain"))?;
                match key {
                    "description" => chain.description = value,
                    "salt" => chain.salt = Some(value),
                    "kdf" => {
                        chain.kdf = Some(parse_kdf(&value).ok_or_else(|| {
                            KeychainError::storable(line, format!("invalid kdf '{value}'"))
                        })?)
                    }
                    "validator" => {
                        let (ciphertext, iv) = value.split_once(' ').ok_or_else(|| {
                            KeychainError::storable(line, "validator needs ciphertext and iv")
                        })?;
                        chain.validator = Some(EncryptedPassword {
                            ciphertext: ciphertext.to_string(),
                            iv: iv.to_string(),
                        });
                    }
                    "link" => chain.links.push(StorableChainLink {
                        name: value,
                        description: String::new(),
                        password: String::new(),
                        iv: None,
                    }),
                    other => {
                        return Err(KeychainError::storable(
                            line,
                            format!("unknown chain field '{other}'"),
                        ))
                    }
                }
            }
            (4, _) => {
                let link = storable
                    .chains
                    .last_mut()
                    .and_then(|c| c.links.last_mut())
                    .ok_or_else(|| KeychainError::storable(line, "field outside of a link"))?;
                match key {
                    "description" => link.description = value,
                    "password" => link.password = value,
                    "iv" => link.iv = Some(value),
                    other => {
                        return Err(KeychainError::storable(
                            line,
                            format!("unknown link field '{other}'"),
                        ))
                    }
                }
            }
            _ => {
                return Err(KeychainError::storable(
                    line,
                    format!("unexpected '{key}' at indentation {indent}"),
                ))
            }
        }
    }

    Ok(storable)
}

fn field(out: &mut String, level: usize, key: &str, value: &str) {
    out.push_str(&"  ".repeat(level));
    out.push_str(key);
    out.push(':');
    if !value.is_empty() {
        out.push(' ');
        out.push_str(&escape(value));
    }
    out.push('\n');
}

fn split_field(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let value = value.strip_prefix(' ').unwrap_or(value);
    Some((key.trim(), value))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape(value: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => return Err(format!("unknown escape '\\{other}'")),
            None => return Err("dangling backslash".to_string()),
        }
    }
    Ok(out)
}

fn parse_kdf(value: &str) -> Option<KdfParams> {
    let mut parts = value.split(';').map(|p| p.split_once('='));
    let mut next = |name: &str| -> Option<u32> {
        let (key, number) = parts.next()??;
        (key.trim() == name).then(|| number.trim().parse().ok())?
    };
    let kdf = KdfParams {
        memory_kib: next("m")?,
        iterations: next("t")?,
        parallelism: next("p")?,
    };
    parts.next().is_none().then_some(kdf)
}
