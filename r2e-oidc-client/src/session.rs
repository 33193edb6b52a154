use std::sync::Arc;

use dashmap::DashMap;

/// Key/value storage scoped to one caller: an HTTP session or the caller's
/// cookie jar.
///
/// Implement this trait over your session backend or request cookies. The
/// engine only ever reads, writes and removes its own keys.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: &str, value: Vec<u8>);
    fn remove(&self, key: &str) -> Option<Vec<u8>>;
}

/// In-memory store for development and testing.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    values: Arc<DashMap<String, Vec<u8>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.values.get(key).map(|v| v.value().clone())
    }

    fn put(&self, key: &str, value: Vec<u8>) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.values.remove(key).map(|(_, v)| v)
    }
}

/// The two places pending authentication state can live for one request.
///
/// `use_session` in the configuration decides which one the engine uses.
#[derive(Clone, Copy)]
pub struct AuthStorage<'a> {
    pub session: &'a dyn SessionStore,
    pub cookies: &'a dyn SessionStore,
}

impl<'a> AuthStorage<'a> {
    pub fn new(session: &'a dyn SessionStore, cookies: &'a dyn SessionStore) -> Self {
        Self { session, cookies }
    }

    /// Use the same store for both.
    pub fn single(store: &'a dyn SessionStore) -> Self {
        Self {
            session: store,
            cookies: store,
        }
    }

    pub(crate) fn select(&self, use_session: bool) -> &'a dyn SessionStore {
        if use_session {
            self.session
        } else {
            self.cookies
        }
    }
}
