use dashmap::DashMap;
use std::sync::Arc;

/// Per-user conversation state between "URL received" and "format chosen".
/// At most one session per user; a new URL overwrites the previous one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    pub pending_url: String,
    pub title: Option<String>,
}

#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<DashMap<u64, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_url(&self, user_id: u64, url: String) {
        self.inner.insert(
            user_id,
            Session {
                pending_url: url,
                title: None,
            },
        );
    }

    /// Attaches the probed title to the current session, if one exists.
    pub fn set_title(&self, user_id: u64, title: Option<String>) {
        if let Some(mut session) = self.inner.get_mut(&user_id) {
            session.title = title;
        }
    }

    pub fn pending_url(&self, user_id: u64) -> Option<String> {
        self.inner.get(&user_id).map(|s| s.pending_url.clone())
    }

    pub fn title(&self, user_id: u64) -> Option<String> {
        self.inner.get(&user_id).and_then(|s| s.title.clone())
    }

    /// Consumes the session. Called when a format command completes,
    /// whether it succeeded or failed.
    pub fn clear(&self, user_id: u64) {
        self.inner.remove(&user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_url_overwrites_previous_session() {
        let store = SessionStore::new();
        store.set_url(1, "https://youtu.be/first".into());
        store.set_url(1, "https://youtu.be/second".into());
        assert_eq!(store.pending_url(1).as_deref(), Some("https://youtu.be/second"));
    }

    #[test]
    fn clear_consumes_the_session() {
        let store = SessionStore::new();
        store.set_url(1, "https://youtu.be/x".into());
        store.clear(1);
        assert_eq!(store.pending_url(1), None);
    }

    #[test]
    fn sessions_are_per_user() {
        let store = SessionStore::new();
        store.set_url(1, "https://youtu.be/a".into());
        assert_eq!(store.pending_url(2), None);
    }

    #[test]
    fn title_attaches_to_the_session_and_resets_with_a_new_url() {
        let store = SessionStore::new();
        store.set_url(1, "https://youtu.be/a".into());
        store.set_title(1, Some("clip".into()));
        assert_eq!(store.title(1).as_deref(), Some("clip"));

        store.set_url(1, "https://youtu.be/b".into());
        assert_eq!(store.title(1), None);
    }

    #[test]
    fn title_without_a_session_is_a_no_op() {
        let store = SessionStore::new();
        store.set_title(7, Some("clip".into()));
        assert_eq!(store.title(7), None);
    }
}
