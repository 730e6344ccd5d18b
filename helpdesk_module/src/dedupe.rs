//! Duplicate detection for claimed queue rows.
//!
//! Two passes: an exact Message-ID match against rows that were already
//! handled, then a fuzzy comparison against the same sender's recent mail.
//! The fuzzy pass is a heuristic and will occasionally misjudge.

use std::sync::OnceLock;

use chrono::Duration;
use regex::Regex;
use uuid::Uuid;

use crate::email_queue::{EmailQueue, EmailQueueError, QueuedEmail};
use crate::inbound::InboundEmail;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.90;
pub const DEFAULT_WINDOW_SECS: i64 = 600;
pub const DEFAULT_MAX_COMPARE_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateVerdict {
    Unique,
    DuplicateMessageId { original: Uuid },
    SimilarContent { original: Uuid, similarity: f64 },
}

impl DuplicateVerdict {
    pub fn original(&self) -> Option<Uuid> {
        match self {
            DuplicateVerdict::Unique => None,
            DuplicateVerdict::DuplicateMessageId { original }
            | DuplicateVerdict::SimilarContent { original, .. } => Some(*original),
        }
    }

    pub fn reason(&self) -> String {
        match self {
            DuplicateVerdict::Unique => "unique".to_string(),
            DuplicateVerdict::DuplicateMessageId { .. } => {
                "message-id already processed".to_string()
            }
            DuplicateVerdict::SimilarContent { similarity, .. } => {
                format!("similar content from same sender ({:.3})", similarity)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    window: Duration,
    threshold: f64,
    max_compare_chars: usize,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(
            Duration::seconds(DEFAULT_WINDOW_SECS),
            DEFAULT_SIMILARITY_THRESHOLD,
        )
    }
}

impl DuplicateDetector {
    pub fn new(window: Duration, threshold: f64) -> Self {
        Self {
            window,
            threshold,
            max_compare_chars: DEFAULT_MAX_COMPARE_CHARS,
        }
    }

    pub fn with_max_compare_chars(mut self, max_compare_chars: usize) -> Self {
        self.max_compare_chars = max_compare_chars.max(1);
        self
    }

    pub fn check(
        &self,
        queue: &dyn EmailQueue,
        row: &QueuedEmail,
    ) -> Result<DuplicateVerdict, EmailQueueError> {
        if let Some(original) = queue.find_processed_by_message_id(&row.email.message_id, &row.id)? {
            return Ok(DuplicateVerdict::DuplicateMessageId { original });
        }

        let Some(sender) = row.email.from_address.as_deref() else {
            return Ok(DuplicateVerdict::Unique);
        };
        let until = row.email.received_at;
        let since = until - self.window;
        let recent = queue.recent_processed_from_sender(sender, since, until, &row.id)?;
        Ok(self.classify(&row.email, recent.iter().map(|prior| (prior.id, &prior.email))))
    }

    /// Compares `candidate` against earlier mail, returning the first prior
    /// email that is similar enough. Time window filtering is the caller's job.
    pub fn classify<'a, I>(&self, candidate: &InboundEmail, previous: I) -> DuplicateVerdict
    where
        I: IntoIterator<Item = (Uuid, &'a InboundEmail)>,
    {
        let subject = normalize_subject(candidate.subject.as_deref().unwrap_or(""));
        let body = normalize_body(candidate, self.max_compare_chars);
        for (id, prior) in previous {
            if normalize_subject(prior.subject.as_deref().unwrap_or("")) != subject {
                continue;
            }
            let prior_body = normalize_body(prior, self.max_compare_chars);
            let similarity = strsim::normalized_levenshtein(&body, &prior_body);
            if similarity > self.threshold {
                return DuplicateVerdict::SimilarContent {
                    original: id,
                    similarity,
                };
            }
        }
        DuplicateVerdict::Unique
    }
}

fn reply_prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:(?:re|fwd?|aw|sv)\s*(?:\[\d+\])?\s*:\s*)+")
            .expect("reply prefix pattern")
    })
}

fn ticket_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\[\s*(?:ticket\s*)?#\s*(\d+)\s*\]|\bticket\s*#\s*(\d+)")
            .expect("ticket token pattern")
    })
}

fn html_noise_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)\b.*?</(?:script|style)\s*>|<[^>]*>")
            .expect("html tag pattern")
    })
}

/// `"Re: FW: [Ticket #12] Printer  offline"` and `"printer offline"` compare equal.
pub fn normalize_subject(subject: &str) -> String {
    let without_tokens = ticket_token_pattern().replace_all(subject, " ");
    let without_prefixes = reply_prefix_pattern().replace(&without_tokens, "");
    collapse_whitespace(&without_prefixes.to_lowercase())
}

/// Ticket number quoted in a subject, e.g. `[#42]` or `Ticket #42`.
pub fn ticket_reference(subject: &str) -> Option<i64> {
    let captures = ticket_token_pattern().captures(subject)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))?
        .as_str()
        .parse()
        .ok()
}

pub fn normalize_body(email: &InboundEmail, max_chars: usize) -> String {
    let raw = match (&email.text_body, &email.html_body) {
        (Some(text), _) => text.clone(),
        (None, Some(html)) => strip_html(html),
        (None, None) => String::new(),
    };
    let unquoted = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect::<Vec<_>>()
        .join("\n");
    collapse_whitespace(&unquoted.to_lowercase())
        .chars()
        .take(max_chars)
        .collect()
}

pub fn strip_html(html: &str) -> String {
    let text = html_noise_pattern().replace_all(html, " ");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email_queue::{NewQueuedEmail, QueueSettings, SqliteEmailQueue};
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::TempDir;

    fn email(subject: &str, body: &str) -> InboundEmail {
        InboundEmail {
            message_id: format!("{}@x", Uuid::new_v4()),
            from_address: Some("dana@customer.example".to_string()),
            from_name: None,
            to_addresses: Vec::new(),
            cc_addresses: Vec::new(),
            subject: Some(subject.to_string()),
            text_body: Some(body.to_string()),
            html_body: None,
            in_reply_to: Vec::new(),
            references: Vec::new(),
            received_at: Utc.with_ymd_and_hms(2024, 10, 1, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn subject_normalization_strips_prefixes_and_ticket_tokens() {
        assert_eq!(
            normalize_subject("Re: FW: [Ticket #12] Printer   Offline"),
            "printer offline"
        );
        assert_eq!(normalize_subject("AW: Sv: re: [#4] printer offline"), "printer offline");
        assert_eq!(normalize_subject("Ticket #99 printer offline"), "printer offline");
        assert_eq!(normalize_subject("Regarding printers"), "regarding printers");
    }

    #[test]
    fn ticket_reference_reads_bracketed_and_plain_tokens() {
        assert_eq!(ticket_reference("Re: [#42] Printer offline"), Some(42));
        assert_eq!(ticket_reference("[Ticket #7] Hello"), Some(7));
        assert_eq!(ticket_reference("Update on ticket #1001"), Some(1001));
        assert_eq!(ticket_reference("Order 42 missing"), None);
    }

    #[test]
    fn body_normalization_drops_quotes_and_html() {
        let mut reply = email("x", "Thanks!\n> On Monday you wrote:\n>  old text\nBye");
        assert_eq!(normalize_body(&reply, 100), "thanks! bye");

        reply.text_body = None;
        reply.html_body = Some(
            "<html><style>p{color:red}</style><p>Hello&nbsp;<b>World</b></p></html>".to_string(),
        );
        assert_eq!(normalize_body(&reply, 100), "hello world");
        assert_eq!(normalize_body(&reply, 5), "hello");
    }

    #[test]
    fn near_identical_mail_with_same_subject_is_a_duplicate() {
        let detector = DuplicateDetector::default();
        let original = email("Printer offline", "The printer on floor 3 is offline again today.");
        let resend = email("Re: Printer offline", "The printer on floor 3 is offline again today!");
        let original_id = Uuid::new_v4();

        match detector.classify(&resend, [(original_id, &original)]) {
            DuplicateVerdict::SimilarContent {
                original,
                similarity,
            } => {
                assert_eq!(original, original_id);
                assert!(similarity > 0.9);
            }
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[test]
    fn different_subject_or_body_is_unique() {
        let detector = DuplicateDetector::default();
        let original = email("Printer offline", "The printer on floor 3 is offline.");
        let other_subject = email("Scanner offline", "The printer on floor 3 is offline.");
        let other_body = email("Printer offline", "Can you also reset my VPN password?");

        assert_eq!(
            detector.classify(&other_subject, [(Uuid::new_v4(), &original)]),
            DuplicateVerdict::Unique
        );
        assert_eq!(
            detector.classify(&other_body, [(Uuid::new_v4(), &original)]),
            DuplicateVerdict::Unique
        );
    }

    #[test]
    fn similarity_exactly_at_threshold_is_not_a_duplicate() {
        // One edit in ten characters scores exactly 0.9.
        let original = email("Printer offline", "aaaaaaaaaa");
        let candidate = email("Printer offline", "aaaaaaaaab");
        let score = strsim::normalized_levenshtein("aaaaaaaaaa", "aaaaaaaaab");

        let at_threshold = DuplicateDetector::new(Duration::minutes(10), score);
        assert_eq!(
            at_threshold.classify(&candidate, [(Uuid::new_v4(), &original)]),
            DuplicateVerdict::Unique
        );
        assert_eq!(
            DuplicateDetector::default().classify(&candidate, [(Uuid::new_v4(), &original)]),
            DuplicateVerdict::Unique
        );

        let below = DuplicateDetector::new(Duration::minutes(10), score - 0.01);
        assert!(matches!(
            below.classify(&candidate, [(Uuid::new_v4(), &original)]),
            DuplicateVerdict::SimilarContent { .. }
        ));
    }

    #[test]
    fn compare_limit_ignores_trailing_differences() {
        let original = email("Printer offline", "Printer on floor 3 is offline. Sent from my phone");
        let candidate = email("Printer offline", "Printer on floor 3 is offline. -- Dana, Facilities");
        assert_eq!(
            DuplicateDetector::default().classify(&candidate, [(Uuid::new_v4(), &original)]),
            DuplicateVerdict::Unique
        );
        let short = DuplicateDetector::default().with_max_compare_chars(30);
        assert!(matches!(
            short.classify(&candidate, [(Uuid::new_v4(), &original)]),
            DuplicateVerdict::SimilarContent { .. }
        ));
    }

    fn queued(
        queue: &SqliteEmailQueue,
        uid: u32,
        sender: &str,
        received_at: DateTime<Utc>,
    ) -> QueuedEmail {
        let mut mail = email("Printer offline", "The printer on floor 3 is offline again today.");
        mail.from_address = Some(sender.to_string());
        mail.received_at = received_at;
        queue
            .enqueue(&NewQueuedEmail {
                account_id: "support".to_string(),
                dedupe_key: NewQueuedEmail::dedupe_key_for("support", 1, uid),
                email: mail,
            })
            .unwrap();
        queue.claim_next().unwrap().expect("claimed")
    }

    #[test]
    fn check_only_compares_processed_mail_from_the_same_sender_inside_the_window() {
        let temp = TempDir::new().unwrap();
        let queue =
            SqliteEmailQueue::new(temp.path().join("queue.db"), QueueSettings::default()).unwrap();
        let detector = DuplicateDetector::new(Duration::minutes(10), 0.9);
        let t0 = Utc.with_ymd_and_hms(2024, 10, 1, 9, 0, 0).unwrap();

        let original = queued(&queue, 1, "dana@customer.example", t0);
        queue.mark_processed(&original.id, Some(1)).unwrap();

        let inside = queued(&queue, 2, "dana@customer.example", t0 + Duration::minutes(4));
        assert!(matches!(
            detector.check(&queue, &inside).unwrap(),
            DuplicateVerdict::SimilarContent { original: id, .. } if id == original.id
        ));

        let at_edge = queued(&queue, 3, "dana@customer.example", t0 + Duration::minutes(10));
        assert_eq!(
            detector.check(&queue, &at_edge).unwrap().original(),
            Some(original.id)
        );

        let outside = queued(
            &queue,
            4,
            "dana@customer.example",
            t0 + Duration::minutes(10) + Duration::seconds(1),
        );
        assert_eq!(detector.check(&queue, &outside).unwrap(), DuplicateVerdict::Unique);

        let other_sender = queued(&queue, 5, "fox@customer.example", t0 + Duration::minutes(1));
        assert_eq!(
            detector.check(&queue, &other_sender).unwrap(),
            DuplicateVerdict::Unique
        );
    }

    #[test]
    fn check_ignores_rows_that_were_not_processed() {
        let temp = TempDir::new().unwrap();
        let queue =
            SqliteEmailQueue::new(temp.path().join("queue.db"), QueueSettings::default()).unwrap();
        let detector = DuplicateDetector::default();
        let t0 = Utc.with_ymd_and_hms(2024, 10, 1, 9, 0, 0).unwrap();

        let failed = queued(&queue, 1, "dana@customer.example", t0);
        queue.mark_rejected(&failed.id, "client service refused").unwrap();
        let in_flight = queued(&queue, 2, "dana@customer.example", t0 + Duration::minutes(1));

        let candidate = queued(&queue, 3, "dana@customer.example", t0 + Duration::minutes(2));
        assert_eq!(detector.check(&queue, &candidate).unwrap(), DuplicateVerdict::Unique);
        assert_eq!(detector.check(&queue, &in_flight).unwrap(), DuplicateVerdict::Unique);
    }

    #[test]
    fn check_flags_a_processed_message_id_before_comparing_content() {
        let temp = TempDir::new().unwrap();
        let queue =
            SqliteEmailQueue::new(temp.path().join("queue.db"), QueueSettings::default()).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 10, 1, 9, 0, 0).unwrap();
        let original = queued(&queue, 1, "dana@customer.example", t0);
        queue.mark_processed(&original.id, Some(1)).unwrap();

        let mut redelivered = original.email.clone();
        redelivered.received_at = t0 + Duration::days(2);
        queue
            .enqueue(&NewQueuedEmail {
                account_id: "support".to_string(),
                dedupe_key: NewQueuedEmail::dedupe_key_for("support", 2, 1),
                email: redelivered,
            })
            .unwrap();
        let row = queue.claim_next().unwrap().expect("claimed");
        assert_eq!(
            DuplicateDetector::default().check(&queue, &row).unwrap(),
            DuplicateVerdict::DuplicateMessageId {
                original: original.id
            }
        );
    }

    #[test]
    fn verdict_reports_original_and_reason() {
        let id = Uuid::new_v4();
        let verdict = DuplicateVerdict::DuplicateMessageId { original: id };
        assert_eq!(verdict.original(), Some(id));
        assert_eq!(verdict.reason(), "message-id already processed");
        assert_eq!(DuplicateVerdict::Unique.original(), None);
    }
}
