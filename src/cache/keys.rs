//! Type-safe cache key builders

use std::fmt;

pub const VERSION: &str = "v1";

pub mod payment {
    use super::*;

    pub const NAMESPACE: &str = "payment";
    pub const REFERENCE_NAMESPACE: &str = "payment_ref";

    /// Payment snapshot by internal id.
    #[derive(Debug, Clone)]
    pub struct PaymentKey {
        pub internal_id: String,
    }

    impl PaymentKey {
        pub fn new(internal_id: impl Into<String>) -> Self {
            Self {
                internal_id: internal_id.into(),
            }
        }
    }

    impl fmt::Display for PaymentKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:{}", VERSION, NAMESPACE, self.internal_id)
        }
    }

    /// Same snapshot, addressed by provider reference.
    #[derive(Debug, Clone)]
    pub struct ReferenceKey {
        pub provider_reference: String,
    }

    impl ReferenceKey {
        pub fn new(provider_reference: impl Into<String>) -> Self {
            Self {
                provider_reference: provider_reference.into(),
            }
        }
    }

    impl fmt::Display for ReferenceKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:{}",
                VERSION, REFERENCE_NAMESPACE, self.provider_reference
            )
        }
    }
}

pub mod provider {
    use super::*;

    pub const STATUS_NAMESPACE: &str = "provider_status";
    pub const CHANGE_NAMESPACE: &str = "status_change";
    pub const EVENT_NAMESPACE: &str = "processed_event";

    #[derive(Debug, Clone)]
    pub struct StatusKey {
        pub provider_reference: String,
    }

    impl StatusKey {
        pub fn new(provider_reference: impl Into<String>) -> Self {
            Self {
                provider_reference: provider_reference.into(),
            }
        }
    }

    impl fmt::Display for StatusKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:{}",
                VERSION, STATUS_NAMESPACE, self.provider_reference
            )
        }
    }

    #[derive(Debug, Clone)]
    pub struct StatusChangeKey {
        pub provider_reference: String,
    }

    impl StatusChangeKey {
        pub fn new(provider_reference: impl Into<String>) -> Self {
            Self {
                provider_reference: provider_reference.into(),
            }
        }
    }

    impl fmt::Display for StatusChangeKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:{}",
                VERSION, CHANGE_NAMESPACE, self.provider_reference
            )
        }
    }

    /// Webhook dedup marker.
    #[derive(Debug, Clone)]
    pub struct ProcessedEventKey {
        pub event_id: String,
    }

    impl ProcessedEventKey {
        pub fn new(event_id: impl Into<String>) -> Self {
            Self {
                event_id: event_id.into(),
            }
        }
    }

    impl fmt::Display for ProcessedEventKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:{}", VERSION, EVENT_NAMESPACE, self.event_id)
        }
    }
}

pub mod user {
    use super::*;

    pub const NAMESPACE: &str = "user_payment";

    #[derive(Debug, Clone)]
    pub struct PaymentInfoKey {
        pub user_id: String,
    }

    impl PaymentInfoKey {
        pub fn new(user_id: impl Into<String>) -> Self {
            Self {
                user_id: user_id.into(),
            }
        }

        /// Glob covering every cached entry for the user.
        pub fn pattern(&self) -> String {
            format!("{}:{}:{}:*", VERSION, NAMESPACE, self.user_id)
        }
    }

    impl fmt::Display for PaymentInfoKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:{}:info", VERSION, NAMESPACE, self.user_id)
        }
    }
}

pub mod rate_limit {
    use super::*;

    pub const NAMESPACE: &str = "rate_limit";

    #[derive(Debug, Clone)]
    pub struct WindowKey {
        pub identifier: String,
        pub scope: String,
        pub window: i64,
    }

    impl WindowKey {
        pub fn new(identifier: impl Into<String>, scope: impl Into<String>, window: i64) -> Self {
            Self {
                identifier: identifier.into(),
                scope: scope.into(),
                window,
            }
        }
    }

    impl fmt::Display for WindowKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:{}:{}:{}",
                VERSION, NAMESPACE, self.scope, self.identifier, self.window
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_keys() {
        assert_eq!(
            payment::PaymentKey::new("6f1c2d1e").to_string(),
            "v1:payment:6f1c2d1e"
        );
        assert_eq!(
            payment::ReferenceKey::new("pi_123").to_string(),
            "v1:payment_ref:pi_123"
        );
    }

    #[test]
    fn test_provider_keys() {
        assert_eq!(
            provider::StatusKey::new("pi_123").to_string(),
            "v1:provider_status:pi_123"
        );
        assert_eq!(
            provider::StatusChangeKey::new("pi_123").to_string(),
            "v1:status_change:pi_123"
        );
        assert_eq!(
            provider::ProcessedEventKey::new("evt_1").to_string(),
            "v1:processed_event:evt_1"
        );
    }

    #[test]
    fn test_user_info_key_sits_under_invalidation_pattern() {
        let key = user::PaymentInfoKey::new("user_42");
        assert_eq!(key.to_string(), "v1:user_payment:user_42:info");
        assert_eq!(key.pattern(), "v1:user_payment:user_42:*");
        assert!(key
            .to_string()
            .starts_with(key.pattern().trim_end_matches('*')));
    }

    #[test]
    fn test_rate_limit_key() {
        let key = rate_limit::WindowKey::new("user_123", "payment", 28_000_000);
        assert_eq!(key.to_string(), "v1:rate_limit:payment:user_123:28000000");
    }
}
