use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use thiserror::Error;

use crate::message::RoomMessage;

/// Why a non-blocking delivery into a member sink did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("member queue is full")]
    Full,
    #[error("member queue is closed")]
    Closed,
}

/// Capability the hub needs from a connected member.
///
/// Implemented by the websocket connection adapter and by test doubles, so the
/// hub never touches a transport directly.
pub trait Member: Send + Sync + 'static {
    fn username(&self) -> &str;

    fn current_room(&self) -> &str;

    /// Pushes a message into the member's private queue without waiting.
    fn try_deliver(&self, message: Arc<RoomMessage>) -> Result<(), DeliveryError>;

    /// Closes the member's queue. Must tolerate being called more than once.
    fn close_sink(&self);
}

/// A member handle compared by identity rather than username.
#[derive(Clone)]
pub struct MemberRef(Arc<dyn Member>);

impl MemberRef {
    pub fn new(member: Arc<dyn Member>) -> Self {
        Self(member)
    }

    pub fn handle(&self) -> &Arc<dyn Member> {
        &self.0
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl std::ops::Deref for MemberRef {
    type Target = dyn Member;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for MemberRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for MemberRef {}

impl Hash for MemberRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberRef")
            .field("username", &self.0.username())
            .field("room", &self.0.current_room())
            .field("addr", &self.addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    struct Silent(&'static str);

    impl Member for Silent {
        fn username(&self) -> &str {
            self.0
        }

        fn current_room(&self) -> &str {
            "general"
        }

        fn try_deliver(&self, _message: Arc<RoomMessage>) -> Result<(), DeliveryError> {
            Ok(())
        }

        fn close_sink(&self) {}
    }

    #[test]
    fn identity_ignores_username() {
        let first = MemberRef::new(Arc::new(Silent("alice")));
        let second = MemberRef::new(Arc::new(Silent("alice")));
        let first_again = first.clone();

        assert_ne!(first, second);
        assert_eq!(first, first_again);

        let set: HashSet<_> = [first, second, first_again].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
