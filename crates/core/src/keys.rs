/// Store key naming for one queue class.
///
/// Computed once from the queue type and shared by every component that touches the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub queue_type: String,
    /// Pending list (left push, right lease).
    pub queue_key: String,
    /// Leased-but-unacknowledged list.
    pub processing_key: String,
    pub status_key_prefix: String,
    pub retry_key_prefix: String,
    pub terminal_key_prefix: String,
    pub session_key_prefix: String,
    pub session_remaining_prefix: String,
    pub recovery_lock_key: String,
}

const NAMESPACE: &str = "jobmill";

/// Percent-encode the characters that act as separators or glob syntax in store keys,
/// so one queue's keys can never fall under another queue's prefix or scan pattern.
fn escape_segment(raw: &str) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, ':' | '*' | '?' | '[' | ']' | '\\' | '{' | '}' | '%') || c.is_whitespace() {
            let _ = write!(out, "%{:02X}", u32::from(c));
        } else {
            out.push(c);
        }
    }
    out
}

impl QueueKeys {
    pub fn new(queue_type: &str) -> Self {
        let base = format!("{NAMESPACE}:{}", escape_segment(queue_type));
        Self {
            queue_type: queue_type.to_string(),
            queue_key: format!("{base}:pending"),
            processing_key: format!("{base}:processing"),
            status_key_prefix: format!("{base}:status:"),
            retry_key_prefix: format!("{base}:retries:"),
            terminal_key_prefix: format!("{base}:terminal:"),
            session_key_prefix: format!("{base}:session:"),
            session_remaining_prefix: format!("{base}:session-remaining:"),
            recovery_lock_key: format!("{base}:recovery-lock"),
        }
    }

    pub fn status_key(&self, job_id: &str) -> String {
        format!("{}{job_id}", self.status_key_prefix)
    }

    /// Glob matching every status record of this queue class.
    pub fn status_pattern(&self) -> String {
        format!("{}*", self.status_key_prefix)
    }

    pub fn retry_key(&self, job_id: &str) -> String {
        format!("{}{job_id}", self.retry_key_prefix)
    }

    pub fn terminal_key(&self, job_id: &str) -> String {
        format!("{}{job_id}", self.terminal_key_prefix)
    }

    pub fn session_key(&self, session_id: &str) -> String {
        format!("{}{session_id}", self.session_key_prefix)
    }

    pub fn session_remaining_key(&self, session_id: &str) -> String {
        format!("{}{session_id}", self.session_remaining_prefix)
    }

    pub fn job_id_from_status_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.status_key_prefix.as_str())
    }
}
