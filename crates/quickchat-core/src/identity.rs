//! Identity provider contract.

use crate::error::{ChatError, Result};
use tokio::sync::watch;

/// Source of the process-wide authenticated identity.
///
/// The identity may change at any time (sign-out, sign-in as someone else),
/// so callers read it at the point of use instead of holding on to it
/// across await points.
pub trait IdentityProvider: Send + Sync {
    /// The signed-in user id, or `None` when signed out.
    fn current_user(&self) -> Option<String>;

    /// Receiver notified on every sign-in/sign-out transition.
    fn watch(&self) -> watch::Receiver<Option<String>>;
}

/// Fails unless `user_id` is the currently signed-in identity.
pub fn ensure_signed_in_as(identity: &dyn IdentityProvider, user_id: &str) -> Result<()> {
    match identity.current_user() {
        Some(current) if current == user_id => Ok(()),
        Some(current) => Err(ChatError::unauthenticated(format!(
            "acting as '{}' but signed in as '{}'",
            user_id, current
        ))),
        None => Err(ChatError::unauthenticated("no signed-in user")),
    }
}
