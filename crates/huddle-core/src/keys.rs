//! Key naming shared with external inspection tooling.

/// Key holding a session's opaque state.
pub fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Hash key holding a session's participant records.
pub fn participants_key(session_id: &str) -> String {
    format!("participants:{session_id}")
}

/// Pub/sub channel carrying a session's lifecycle events.
pub fn session_channel(session_id: &str) -> String {
    format!("session:{session_id}:events")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats() {
        assert_eq!(session_key("abc"), "session:abc");
        assert_eq!(participants_key("abc"), "participants:abc");
        assert_eq!(session_channel("abc"), "session:abc:events");
    }
}
