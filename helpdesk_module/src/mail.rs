//! Address and message-id normalization shared by fetch, dedupe and threading.

pub fn normalize_email(raw: &str) -> Option<String> {
    let mut value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if let Some(stripped) = value.strip_prefix("mailto:") {
        value = stripped.trim();
    }
    value = value.trim_matches(|ch: char| matches!(ch, '<' | '>' | '"' | '\'' | ',' | ';'));
    if !value.contains('@') {
        return None;
    }

    let mut parts = value.splitn(2, '@');
    let local = parts.next().unwrap_or("").trim();
    let domain = parts.next().unwrap_or("").trim();
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }

    Some(format!(
        "{}@{}",
        local.to_ascii_lowercase(),
        domain.to_ascii_lowercase()
    ))
}

pub fn email_domain(address: &str) -> Option<&str> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
}

pub fn normalize_message_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches(|ch| matches!(ch, '<' | '>'));
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

/// Splits an `In-Reply-To` / `References` header value into normalized ids.
pub fn extract_message_ids(value: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for token in value.split(|ch| matches!(ch, ' ' | '\t' | '\n' | '\r' | ',' | ';')) {
        if let Some(id) = normalize_message_id(token) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Stable id for messages that arrive without a Message-ID header.
pub fn synthesize_message_id(raw_message: &[u8]) -> String {
    format!("{:x}@helpdesk.local", md5::compute(raw_message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_email_handles_brackets_and_case() {
        assert_eq!(
            normalize_email("<Bob@Example.COM>"),
            Some("bob@example.com".to_string())
        );
        assert_eq!(
            normalize_email("mailto:ann@example.com"),
            Some("ann@example.com".to_string())
        );
        assert_eq!(normalize_email("not-an-email"), None);
        assert_eq!(normalize_email("a@b@c"), None);
    }

    #[test]
    fn extract_message_ids_splits_references_header() {
        let ids = extract_message_ids("<A1@mail.example> <b2@mail.example>\r\n <a1@mail.example>");
        assert_eq!(ids, vec!["a1@mail.example", "b2@mail.example"]);
    }

    #[test]
    fn synthesized_ids_are_stable() {
        assert_eq!(
            synthesize_message_id(b"hello"),
            synthesize_message_id(b"hello")
        );
        assert_ne!(
            synthesize_message_id(b"hello"),
            synthesize_message_id(b"hello!")
        );
    }

    #[test]
    fn email_domain_splits_on_last_at() {
        assert_eq!(email_domain("ops@corp.example"), Some("corp.example"));
        assert_eq!(email_domain("nobody"), None);
    }
}
