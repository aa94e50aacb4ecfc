//! Who is acting.

use futures::{stream::BoxStream, StreamExt as _};
use std::{fmt, sync::Arc};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::model::UserId;

/// Supplies the acting user's id. Credentials never pass through here.
pub trait IdentityProvider: Send + Sync + fmt::Debug {
    fn current_user(&self) -> Option<UserId>;

    /// Yields the current user immediately and again whenever it
    /// changes. `None` means signed out.
    fn user_changes(&self) -> BoxStream<'static, Option<UserId>>;
}

/// An identity that is switched explicitly, e.g. by a login handler.
#[derive(Debug, Clone)]
pub struct SessionIdentity(Arc<watch::Sender<Option<UserId>>>);

impl Default for SessionIdentity {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self(Arc::new(tx))
    }
}

impl SessionIdentity {
    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn signed_in(user: impl Into<UserId>) -> Self {
        let this = Self::default();
        this.sign_in(user);
        this
    }

    pub fn sign_in(&self, user: impl Into<UserId>) {
        let user = user.into();
        debug!(%user, "signed in");
        self.0.send_replace(Some(user));
    }

    pub fn sign_out(&self) {
        debug!("signed out");
        self.0.send_replace(None);
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_user(&self) -> Option<UserId> {
        self.0.borrow().clone()
    }

    fn user_changes(&self) -> BoxStream<'static, Option<UserId>> {
        WatchStream::new(self.0.subscribe()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn changes_start_with_the_current_user() {
        let identity = SessionIdentity::signed_in("u1");
        assert_eq!(identity.current_user(), Some("u1".into()));

        let mut changes = identity.user_changes();
        assert_eq!(changes.next().await, Some(Some("u1".into())));

        identity.sign_out();
        assert_eq!(changes.next().await, Some(None));
        assert_eq!(identity.current_user(), None);
    }
}
