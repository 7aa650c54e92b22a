//! CSV storable codec: one row per link, RFC 4180 quoting.

use super::{Storable, StorableChain, StorableChainLink};
use crate::crypto::{EncryptedPassword, KdfParams};
use crate::error::{KeychainError, Result};

const HEADER: [&str; 10] = [
    "chain",
    "chain_description",
    "salt",
    "kdf",
    "validator",
    "validator_iv",
    "name",
    "description",
    "password",
    "iv",
];

pub(super) fn encode(storable: &Storable) -> String {
    let mut out = String::new();
    write_row(&mut out, &HEADER);

    for chain in &storable.chains {
        let kdf = chain.kdf.map(format_kdf).unwrap_or_default();
        let (validator, validator_iv) = chain
            .validator
            .as_ref()
            .map(|v| (v.ciphertext.as_str(), v.iv.as_str()))
            .unwrap_or_default();
        let chain_cols = [
            chain.name.as_str(),
            chain.description.as_str(),
            chain.salt.as_deref().unwrap_or_default(),
            kdf.as_str(),
            validator,
            validator_iv,
        ];

        if chain.links.is_empty() {
            let mut row = chain_cols.to_vec();
            row.extend(["", "", "", ""]);
            write_row(&mut out, &row);
        }

        for link in &chain.links {
            let mut row = chain_cols.to_vec();
            row.extend([
                link.name.as_str(),
                link.description.as_str(),
                link.password.as_str(),
                link.iv.as_deref().unwrap_or_default(),
            ]);
            write_row(&mut out, &row);
        }
    }

    out
}

pub(super) fn decode(text: &str) -> Result<Storable> {
    let records = parse_records(text)?;
    let mut records = records.into_iter();

    let Some((line, header)) = records.next() else {
        return Ok(Storable::default());
    };
    if header != HEADER {
        return Err(KeychainError::storable(line, "unexpected CSV header"));
    }

    let mut storable = Storable::default();
    for (line, row) in records {
        if row.len() == 1 && row[0].is_empty() {
            continue;
        }
        if row.len() != HEADER.len() {
            return Err(KeychainError::storable(
                line,
                format!("expected {} columns, found {}", HEADER.len(), row.len()),
            ));
        }

        let opt = |s: &str| (!s.is_empty()).then(|| s.to_string());

        if !row[2].is_empty() {
            storable.private = true;
        }

        let index = match storable.chains.iter().position(|c| c.name == row[0]) {
            Some(index) => index,
            None => {
                let kdf = if row[3].is_empty() {
                    None
                } else {
                    Some(parse_kdf(&row[3]).ok_or_else(|| {
                        KeychainError::storable(line, format!("invalid kdf '{}'", row[3]))
                    })?)
                };
                let validator = match (opt(&row[4]), opt(&row[5])) {
                    (Some(ciphertext), Some(iv)) => Some(EncryptedPassword { ciphertext, iv }),
                    (None, None) => None,
                    _ => {
                        return Err(KeychainError::storable(line, "incomplete validator"));
                    }
                };
                storable.chains.push(StorableChain {
                    name: row[0].clone(),
                    description: row[1].clone(),
                    salt: opt(&row[2]),
                    kdf,
                    validator,
                    links: Vec::new(),
                });
                storable.chains.len() - 1
            }
        };

        if row[6].is_empty() && row[8].is_empty() {
            continue;
        }

        storable.chains[index].links.push(StorableChainLink {
            name: row[6].clone(),
            description: row[7].clone(),
            password: row[8].clone(),
            iv: opt(&row[9]),
        });
    }

    Ok(storable)
}

fn format_kdf(kdf: KdfParams) -> String {
    format!("m={};t={};p={}", kdf.memory_kib, kdf.iterations, kdf.parallelism)
}

fn parse_kdf(value: &str) -> Option<KdfParams> {
    let mut kdf = KdfParams::default();
    let mut seen = 0;
    for part in value.split(';') {
        let (key, number) = part.split_once('=')?;
        let number: u32 = number.trim().parse().ok()?;
        match key.trim() {
            "m" => kdf.memory_kib = number,
            "t" => kdf.iterations = number,
            "p" => kdf.parallelism = number,
            _ => return None,
        }
        seen += 1;
    }
    (seen == 3).then_some(kdf)
}

fn write_row(out: &mut String, fields: &[&str]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) || field.trim() != *field {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

/// Split CSV text into records, each tagged with its 1-based starting line.
fn parse_records(text: &str) -> Result<Vec<(usize, Vec<String>)>> {
    let mut records = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;
    let mut row_line = 1;
    let mut in_quotes = false;
    let mut quoted_field = false;

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(ch);
                }
                _ => field.push(ch),
            }
            continue;
        }

        match ch {
            '"' if field.is_empty() && !quoted_field => {
                in_quotes = true;
                quoted_field = true;
            }
            '"' => return Err(KeychainError::storable(line, "stray quote in field")),
            ',' => {
                row.push(std::mem::take(&mut field));
                quoted_field = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                records.push((row_line, std::mem::take(&mut row)));
                quoted_field = false;
                line += 1;
                row_line = line;
            }
            _ if quoted_field => {
                return Err(KeychainError::storable(line, "text after closing quote"));
            }
            _ => field.push(ch),
        }
    }

    if in_quotes {
        return Err(KeychainError::storable(row_line, "unterminated quoted field"));
    }
    if !field.is_empty() || !row.is_empty() || quoted_field {
        row.push(field);
        records.push((row_line, row));
    }

    Ok(records)
}
