use anyhow::{anyhow, Result};

pub fn validate_ssid(ssid: &str) -> Result<()> {
    if ssid.is_empty() {
        return Err(anyhow!("WiFi SSID cannot be empty"));
    }
    if ssid.len() > 32 {
        return Err(anyhow!("WiFi SSID must be 32 characters or less"));
    }
    if ssid.chars().any(|c| c.is_control()) {
        return Err(anyhow!("WiFi SSID cannot contain control characters"));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<()> {
    // Open networks carry an empty secret.
    if password.is_empty() {
        return Ok(());
    }
    if password.len() < 8 || password.len() > 64 {
        return Err(anyhow!("WiFi password must be 8 to 64 characters"));
    }
    Ok(())
}

/// Store paths: absolute, no parent hops, no control characters.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(anyhow!("Path cannot be empty"));
    }
    if !path.starts_with('/') {
        return Err(anyhow!("Path must start with '/'"));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(anyhow!("Path cannot contain '..'"));
    }
    if path.chars().any(|c| c.is_control() || c == '\\') {
        return Err(anyhow!("Path contains invalid characters"));
    }
    if path.len() > 255 {
        return Err(anyhow!("Path must be 255 characters or less"));
    }
    Ok(())
}

/// Adds the leading `/` that form posts often drop.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

pub fn validate_sha256_hex(digest: &str) -> Result<()> {
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!("sha256 must be 64 hexadecimal characters"));
    }
    Ok(())
}
