//! Input validation utilities to prevent panics and security vulnerabilities
//!
//! This module provides safe validation for external inputs to prevent:
//! - Panic-induced service crashes
//! - OOM attacks via unbounded strings
//! - Path traversal attacks
//! - Command injection

use anyhow::{anyhow, Result};

/// Maximum length for resource IDs (stream_id, recording_id, device_id, etc.)
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum length for URIs (RTSP, HTTP, S3, etc.)
pub const MAX_URI_LENGTH: usize = 4096;

// ============================================================================
// String Validation
// ============================================================================

/// Validate string length against a maximum
pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<()> {
    if value.len() > max_length {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes (got {})",
            field_name,
            max_length,
            value.len()
        ));
    }
    Ok(())
}

/// Validate non-empty string
pub fn validate_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} cannot be empty", field_name));
    }
    Ok(())
}

/// Validate resource ID (stream_id, recording_id, etc.)
pub fn validate_id(id: &str, field_name: &str) -> Result<()> {
    validate_non_empty(id, field_name)?;
    validate_length(id, MAX_ID_LENGTH, field_name)?;

    // Prevent path traversal in IDs
    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(anyhow!(
            "{} contains invalid characters (no path separators or '..' allowed)",
            field_name
        ));
    }

    Ok(())
}

/// Validate URI (RTSP, HTTP, S3, etc.)
pub fn validate_uri(uri: &str, field_name: &str) -> Result<()> {
    validate_non_empty(uri, field_name)?;
    validate_length(uri, MAX_URI_LENGTH, field_name)?;

    // Prevent shell metacharacters (command injection)
    let dangerous_chars = ['`', '$', ';', '|', '&', '\n', '\r'];
    if uri.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(anyhow!(
            "{} contains dangerous shell metacharacters",
            field_name
        ));
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
