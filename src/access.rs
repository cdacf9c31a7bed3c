//! 访问令牌校验与 proof key 校验的接入点。

use axum::http::{HeaderMap, Method, Uri};
use std::collections::HashSet;

/// Sentinel token the WOPI validator uses to exercise the 401 path.
pub const INVALID_TOKEN_SENTINEL: &str = "INVALID";

/// Decides whether an access token may perform the requested operation.
pub trait AccessGate: Send + Sync {
    fn check_access(&self, token: &str, write_required: bool) -> bool;
}

/// Validates that a request really comes from the expected editing client.
pub trait ProofValidator: Send + Sync {
    fn validate(&self, method: &Method, uri: &Uri, headers: &HeaderMap) -> bool;
}

/// 默认令牌策略：令牌非空且不是哨兵值；配置了白名单时还必须在名单内。
#[derive(Debug, Default)]
pub struct TokenPolicy {
    allowed: Option<HashSet<String>>,
}

impl TokenPolicy {
    pub fn new(allowed: Vec<String>) -> Self {
        let allowed = if allowed.is_empty() {
            None
        } else {
            Some(allowed.into_iter().collect())
        };
        Self { allowed }
    }
}

impl AccessGate for TokenPolicy {
    fn check_access(&self, token: &str, _write_required: bool) -> bool {
        if token.trim().is_empty() || token == INVALID_TOKEN_SENTINEL {
            return false;
        }
        self.allowed
            .as_ref()
            .is_none_or(|allowed| allowed.contains(token))
    }
}

/// Proof keys are not verified by this host.
#[derive(Debug, Default)]
pub struct AcceptAllProofs;

impl ProofValidator for AcceptAllProofs {
    fn validate(&self, _method: &Method, _uri: &Uri, _headers: &HeaderMap) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_policy_rejects_blank_and_sentinel_tokens() {
        let policy = TokenPolicy::default();
        assert!(policy.check_access("abc", false));
        assert!(policy.check_access("abc", true));
        assert!(!policy.check_access("", false));
        assert!(!policy.check_access("   ", true));
        assert!(!policy.check_access(INVALID_TOKEN_SENTINEL, false));
    }

    #[test]
    fn allow_list_narrows_accepted_tokens() {
        let policy = TokenPolicy::new(vec!["alpha".into()]);
        assert!(policy.check_access("alpha", true));
        assert!(!policy.check_access("beta", false));
    }
}
