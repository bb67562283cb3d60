// ============================================================================
// Call Context - ambient identity for a single request
// ============================================================================

/// Identity of the caller on whose behalf events are persisted or dispatched.
///
/// Repositories use it to fill empty event metadata; dispatchers hand it to
/// every subscriber.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallContext {
    pub account_id: Option<String>,
    pub user_id: Option<String>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn account(&self) -> Option<&str> {
        self.account_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn user(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_values_read_as_absent() {
        let ctx = CallContext::new().with_account("").with_user("user-1");
        assert_eq!(ctx.account(), None);
        assert_eq!(ctx.user(), Some("user-1"));
    }
}
