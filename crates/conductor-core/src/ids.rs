use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::from_raw(s)
            }
        }
    };
}

// Conversation scope. Callers usually supply these.
branded_id!(TenantId, "tenant");
branded_id!(SessionId, "sess");
branded_id!(AgentId, "agent");

// Execution scope. Generated per inbound message.
branded_id!(RequestId, "req");
branded_id!(RunId, "run");
branded_id!(StreamId, "strm");
branded_id!(SubscriberId, "sub");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix() {
        assert!(TenantId::new().as_str().starts_with("tenant_"));
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(RequestId::new().as_str().starts_with("req_"));
        assert!(RunId::new().as_str().starts_with("run_"));
        assert!(StreamId::new().as_str().starts_with("strm_"));
        assert!(SubscriberId::new().as_str().starts_with("sub_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = StreamId::new();
        let b = StreamId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn from_raw_preserves_caller_value() {
        let id = AgentId::from_raw("billing-bot");
        assert_eq!(id.as_str(), "billing-bot");
        assert_eq!(AgentId::from("billing-bot"), id);
    }

    #[test]
    fn serde_is_transparent() {
        let id = TenantId::from_raw("acme");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"acme\"");
        let parsed: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<RunId> = (0..100).map(|_| RunId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
