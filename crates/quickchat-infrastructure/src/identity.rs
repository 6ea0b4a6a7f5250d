//! In-process identity provider.

use quickchat_core::identity::IdentityProvider;
use tokio::sync::watch;

/// Identity provider whose signed-in user is set directly by the host.
///
/// Every transition is broadcast to receivers obtained from `watch()`.
#[derive(Debug)]
pub struct InMemoryIdentityProvider {
    sender: watch::Sender<Option<String>>,
}

impl InMemoryIdentityProvider {
    pub fn new(initial: Option<String>) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self::new(Some(user_id.into()))
    }

    pub fn signed_out() -> Self {
        Self::new(None)
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        tracing::info!("[Identity] Signed in as {}", user_id);
        self.sender.send_replace(Some(user_id));
    }

    pub fn sign_out(&self) {
        tracing::info!("[Identity] Signed out");
        self.sender.send_replace(None);
    }
}

impl IdentityProvider for InMemoryIdentityProvider {
    fn current_user(&self) -> Option<String> {
        self.sender.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<String>> {
        self.sender.subscribe()
    }
}
