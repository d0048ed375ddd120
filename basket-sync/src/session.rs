//! Session context: who is editing.
//!
//! An explicit object handed to the coordinator at construction — never a
//! process-wide global. The identity provider is external; it hands over an
//! opaque user id (or none when signed out) and this context is refreshed
//! through `set_user`. Observers follow auth changes live through `watch`.

use tokio::sync::watch;

pub struct SessionContext {
    user: watch::Sender<Option<String>>,
}

impl SessionContext {
    pub fn new(user_id: Option<String>) -> Self {
        let (user, _) = watch::channel(user_id);
        Self { user }
    }

    pub fn anonymous() -> Self {
        Self::new(None)
    }

    /// Current user id, if signed in.
    pub fn current_user_id(&self) -> Option<String> {
        self.user.borrow().clone()
    }

    /// Refresh from the identity provider.
    pub fn set_user(&self, user_id: Option<String>) {
        // send_replace delivers even when nobody is watching yet
        self.user.send_replace(user_id);
    }

    /// Live auth-state observation.
    pub fn watch(&self) -> watch::Receiver<Option<String>> {
        self.user.subscribe()
    }
}
