//! Input validation for everything that ends up in an iptables argument list
//!
//! Rules arrive from other daemon components and are turned into process
//! arguments verbatim. Nothing goes through a shell, but a malformed value can
//! still change the meaning of the invocation (an interface name starting with
//! `-` is parsed as a flag), so every free-form string is checked here first.

use crate::core::error::{Error, Result};
use crate::core::rule::Rule;

/// Maximum length accepted by the xt_comment match
const MAX_COMMENT_LEN: usize = 256;

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
/// - Cannot start with '-' (would be parsed as an option)
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> std::result::Result<String, String> {
    if name.is_empty() {
        return Ok(String::new());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." || name.starts_with('-') {
        return Err("Invalid interface name".to_string());
    }

    // Check for valid characters (ASCII alphanumeric only, plus dot, dash, underscore)
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a protocol name or number as accepted by `-p`.
///
/// # Errors
///
/// Returns `Err` for names with characters iptables never accepts.
pub fn validate_protocol(protocol: &str) -> std::result::Result<String, String> {
    if protocol.is_empty() {
        return Ok(String::new());
    }

    if protocol.len() > 32 {
        return Err("Protocol name too long (max 32 characters)".to_string());
    }

    if protocol.starts_with('-')
        || !protocol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(format!("Invalid protocol '{protocol}'"));
    }

    Ok(protocol.to_string())
}

/// Validates a rule comment tag.
///
/// Comments are passed as a single argument and re-parsed from `iptables -S`
/// output during a flush, so whitespace and quotes are rejected.
///
/// # Errors
///
/// Returns `Err` if the comment is empty, too long or not plain ASCII.
pub fn validate_comment(comment: &str) -> std::result::Result<String, String> {
    if comment.is_empty() {
        return Err("Comment cannot be empty".to_string());
    }

    if comment.len() > MAX_COMMENT_LEN {
        return Err(format!("Comment too long (max {MAX_COMMENT_LEN} characters)"));
    }

    if !comment
        .chars()
        .all(|c| c.is_ascii_graphic() && !matches!(c, '"' | '\'' | '\\'))
    {
        return Err("Comment contains invalid characters".to_string());
    }

    Ok(comment.to_string())
}

fn invalid(field: &str, message: String) -> Error {
    Error::Validation {
        field: field.to_string(),
        message,
    }
}

/// Validates every free-form field of a rule before it is compiled.
///
/// # Errors
///
/// Returns `Error::Validation` naming the first offending field.
pub fn validate_rule(rule: &Rule) -> Result<()> {
    for iface in &rule.interfaces {
        validate_interface(&iface.name).map_err(|e| invalid("interfaces", e))?;
    }
    for protocol in &rule.protocols {
        validate_protocol(protocol).map_err(|e| invalid("protocols", e))?;
    }
    // an empty comment falls back to the default marker
    if let Some(comment) = rule.comment.as_deref().filter(|c| !c.is_empty()) {
        validate_comment(comment).map_err(|e| invalid("comment", e))?;
    }
    Ok(())
}
