use sha2::{Digest, Sha256};

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lowercase and collapse runs of whitespace so cosmetic reformatting of the
/// same message produces the same digest.
pub fn normalize_content(subject: &str, sender: &str, body: &str) -> String {
    let combined = format!("{} {} {}", subject, sender, body);
    combined
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn content_digest(subject: &str, sender: &str, body: &str) -> String {
    sha256_hex(&normalize_content(subject, sender, body))
}

/// Truncate on a char boundary, appending an ellipsis marker when cut.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{}…", cut)
}
