//! Utility functions for keychain operations.

use crate::error::{KeychainError, Result};
use colored::*;
use std::fs;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Longest accepted chain or link name, in characters.
pub const MAX_NAME_LENGTH: usize = 128;

/// Validate a chain or link name and return it trimmed.
pub fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();

    let invalid = |reason: String| KeychainError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("name is empty".to_string()));
    }

    let length = trimmed.chars().count();
    if length > MAX_NAME_LENGTH {
        return Err(invalid(format!(
            "name is {length} characters long, maximum is {MAX_NAME_LENGTH}"
        )));
    }

    if let Some((idx, ch)) = trimmed.chars().enumerate().find(|(_, c)| c.is_control()) {
        return Err(invalid(format!(
            "control character {:?} at position {}",
            ch,
            idx + 1
        )));
    }

    Ok(trimmed.to_string())
}

/// Restrict a file to its owner.
pub fn set_secure_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let permissions = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, permissions)?;
    }
    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}

/// Check file permissions and return warnings.
pub fn check_file_permissions(path: &Path) -> Vec<String> {
    let mut warnings = Vec::new();

    #[cfg(unix)]
    {
        if let Ok(metadata) = fs::metadata(path) {
            let mode = metadata.permissions().mode();

            // Check if group or others have any permissions
            if mode & 0o077 != 0 {
                warnings.push(format!(
                    "File has insecure permissions: {:o}. Run 'chmod 600 {}' to fix.",
                    mode & 0o777,
                    path.display()
                ));
            }
        }
    }

    warnings
}

/// Check if running with appropriate privileges.
pub fn check_privileges() -> Vec<String> {
    let mut warnings = Vec::new();

    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } == 0 {
            warnings.push("Running as root is not recommended".to_string());
        }
    }

    warnings
}

/// Print an error message and exit.
pub fn error_exit(message: &str, code: i32) -> ! {
    eprintln!("{} {}", "Error:".red().bold(), message);
    std::process::exit(code);
}

/// Print a success message.
pub fn success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print a warning message.
pub fn warning(message: &str) {
    eprintln!("{} {}", "Warning:".yellow(), message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("  Email  ").unwrap(), "Email");
        assert_eq!(validate_name("Bank: Chase / checking").unwrap(), "Bank: Chase / checking");
        assert!(validate_name("émoji ok 🔑").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name("tab\there").is_err());
        assert!(validate_name("line\nbreak").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH)).is_ok());
    }

    #[test]
    fn test_invalid_name_message() {
        let err = validate_name("a\u{7}b").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("control character"));
        assert!(msg.contains("position 2"));
    }

    #[cfg(unix)]
    #[test]
    fn test_secure_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        assert_eq!(check_file_permissions(&path).len(), 1);
        set_secure_permissions(&path).unwrap();
        assert!(check_file_permissions(&path).is_empty());
    }
}
