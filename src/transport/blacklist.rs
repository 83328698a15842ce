use dashmap::DashSet;

/// Tokens the server already refused. Reconnecting with one of them would only
/// hammer the server with doomed handshakes.
#[derive(Debug, Default)]
pub struct TokenBlacklist {
    rejected: DashSet<String>,
}

impl TokenBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, token: &str) {
        self.rejected.insert(token.to_string());
    }

    pub fn is_rejected(&self, token: &str) -> bool {
        self.rejected.contains(token)
    }

    /// Called after a fresh login issues a new token.
    pub fn clear(&self) {
        self.rejected.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::TokenBlacklist;

    #[test]
    fn rejected_token_stays_rejected() {
        let blacklist = TokenBlacklist::new();
        assert!(!blacklist.is_rejected("t1"));

        blacklist.reject("t1");
        assert!(blacklist.is_rejected("t1"));
        assert!(!blacklist.is_rejected("t2"));

        blacklist.clear();
        assert!(!blacklist.is_rejected("t1"));
    }
}
