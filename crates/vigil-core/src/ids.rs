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
    };
}

branded_id!(RunId, "run");
branded_id!(EntryId, "jrn");
branded_id!(ApprovalId, "appr");
branded_id!(ToolCallId, "call");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_has_prefix() {
        let id = RunId::new();
        assert!(id.as_str().starts_with("run_"), "got: {id}");
    }

    #[test]
    fn entry_id_has_prefix() {
        let id = EntryId::new();
        assert!(id.as_str().starts_with("jrn_"), "got: {id}");
    }

    #[test]
    fn approval_id_has_prefix() {
        let id = ApprovalId::new();
        assert!(id.as_str().starts_with("appr_"), "got: {id}");
    }

    #[test]
    fn tool_call_id_has_prefix() {
        let id = ToolCallId::new();
        assert!(id.as_str().starts_with("call_"), "got: {id}");
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_is_transparent() {
        let id = ApprovalId::from_raw("appr_fixed");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""appr_fixed""#);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<RunId> = (0..100).map(|_| RunId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
