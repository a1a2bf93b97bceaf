use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::OnceCell;

use crate::traits::IdentityProvider;
use crate::types::{Session, SessionChange, SessionEvent};

/// Handle returned by [`SessionStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(SessionEvent, Option<&Session>) + Send + Sync>;

/// Cached copy of the identity provider's current session.
///
/// Holds at most one session. [`apply`](Self::apply) swaps it wholesale and
/// then notifies listeners in registration order.
pub struct SessionStore<I> {
    identity: Arc<I>,
    current: RwLock<Option<Session>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    initialized: OnceCell<()>,
}

impl<I: IdentityProvider> SessionStore<I> {
    #[must_use]
    pub fn new(identity: Arc<I>) -> Self {
        Self {
            identity,
            current: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            initialized: OnceCell::new(),
        }
    }

    /// Fetch the provider's session once.
    ///
    /// Later calls (and concurrent ones) wait for the first fetch and do
    /// nothing else. A provider error is logged and treated as "no session" so
    /// a logged-out UI can still render.
    pub async fn initialize(&self) -> Option<Session> {
        self.initialized
            .get_or_init(|| async {
                match self.identity.get_session().await {
                    Ok(session) => {
                        self.replace(session);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Session fetch failed, continuing signed out");
                        self.replace(None);
                    }
                }
            })
            .await;
        self.current()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Last known session.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Install the session carried by `change` and notify listeners.
    ///
    /// Returns the session that was current before.
    pub fn apply(&self, change: &SessionChange) -> Option<Session> {
        let previous = self.replace(change.session.clone());

        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(change.event, change.session.as_ref());
        }
        previous
    }

    /// Register a listener for session changes.
    pub fn subscribe<F>(&self, on_change: F) -> ListenerId
    where
        F: Fn(SessionEvent, Option<&Session>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, Arc::new(on_change)));
        id
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub(crate) fn clear_listeners(&self) {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn identity(&self) -> &Arc<I> {
        &self.identity
    }

    fn replace(&self, session: Option<Session>) -> Option<Session> {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::replace(&mut *current, session)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use time::OffsetDateTime;
    use tokio::sync::mpsc;
    use url::Url;

    use super::*;
    use crate::error::Error;
    use crate::types::{SignUpAttributes, User, UserUpdate};

    struct StaticIdentity {
        session: Result<Option<Session>, ()>,
        fetches: AtomicUsize,
    }

    impl IdentityProvider for StaticIdentity {
        async fn sign_in(&self, _: &str, _: &str) -> Result<Session, Error> {
            Err(Error::Unauthenticated)
        }

        async fn sign_up(
            &self,
            _: &str,
            _: &str,
            _: &SignUpAttributes,
        ) -> Result<Option<Session>, Error> {
            Ok(None)
        }

        async fn sign_out(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn get_session(&self) -> Result<Option<Session>, Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.session.clone().map_err(|()| Error::Backend {
                operation: "session fetch",
                status: None,
                detail: "connection reset".into(),
            })
        }

        fn on_session_change(&self) -> mpsc::UnboundedReceiver<SessionChange> {
            mpsc::unbounded_channel().1
        }

        async fn reset_password_for_email(&self, _: &str, _: &Url) -> Result<(), Error> {
            Ok(())
        }

        async fn update_user(&self, _: &UserUpdate) -> Result<(), Error> {
            Ok(())
        }
    }

    fn session(id: &str) -> Session {
        Session::new(User::new(id), "at", "rt", OffsetDateTime::UNIX_EPOCH)
    }

    fn store(session: Result<Option<Session>, ()>) -> SessionStore<StaticIdentity> {
        SessionStore::new(Arc::new(StaticIdentity {
            session,
            fetches: AtomicUsize::new(0),
        }))
    }

    #[tokio::test]
    async fn initialize_fetches_once() {
        let store = store(Ok(Some(session("u-1"))));
        assert!(!store.is_initialized());

        let first = store.initialize().await;
        let second = store.initialize().await;

        assert_eq!(first.unwrap().subject_id().0, "u-1");
        assert_eq!(second.unwrap().subject_id().0, "u-1");
        assert_eq!(store.identity().fetches.load(Ordering::SeqCst), 1);
        assert!(store.is_initialized());
    }

    #[tokio::test]
    async fn initialize_swallows_provider_errors() {
        let store = store(Err(()));
        assert!(store.initialize().await.is_none());
        assert!(store.is_initialized());
        assert!(store.current().is_none());
    }

    #[test]
    fn listeners_see_changes_in_order() {
        let store = store(Ok(None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(move |event, session| {
            sink.lock()
                .unwrap()
                .push((event, session.map(|s| s.subject_id().0.clone())));
        });

        store.apply(&SessionChange::signed_in(session("u-1")));
        store.apply(&SessionChange::token_refreshed(session("u-1")));
        store.apply(&SessionChange::signed_out());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (SessionEvent::SignedIn, Some("u-1".to_string())),
                (SessionEvent::TokenRefreshed, Some("u-1".to_string())),
                (SessionEvent::SignedOut, None),
            ]
        );
        assert!(store.current().is_none());
    }

    #[test]
    fn apply_returns_previous_session() {
        let store = store(Ok(None));
        assert!(store.apply(&SessionChange::signed_in(session("u-1"))).is_none());
        let previous = store.apply(&SessionChange::signed_in(session("u-2")));
        assert_eq!(previous.unwrap().subject_id().0, "u-1");
    }

    #[test]
    fn unsubscribed_listener_is_not_called() {
        let store = store(Ok(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = store.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.apply(&SessionChange::signed_out());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
