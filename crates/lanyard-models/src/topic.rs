use std::fmt;
use std::str::FromStr;

use crate::UnknownValue;

/// Parsed form of a channel topic string. The heartbeat pseudo-topic
/// `phoenix` carries no subject id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Call(String),
    Huddle(String),
    Conversation(String),
    Phoenix,
}

impl Topic {
    pub fn call(id: impl Into<String>) -> Self {
        Topic::Call(id.into())
    }

    pub fn huddle(id: impl Into<String>) -> Self {
        Topic::Huddle(id.into())
    }

    pub fn conversation(id: impl Into<String>) -> Self {
        Topic::Conversation(id.into())
    }

    pub fn subject_id(&self) -> Option<&str> {
        match self {
            Topic::Call(id) | Topic::Huddle(id) | Topic::Conversation(id) => Some(id),
            Topic::Phoenix => None,
        }
    }
}

impl FromStr for Topic {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "phoenix" {
            return Ok(Topic::Phoenix);
        }
        match s.split_once(':') {
            Some(("call", id)) if !id.is_empty() => Ok(Topic::Call(id.to_string())),
            Some(("huddle", id)) if !id.is_empty() => Ok(Topic::Huddle(id.to_string())),
            Some(("conversation", id)) if !id.is_empty() => {
                Ok(Topic::Conversation(id.to_string()))
            }
            _ => Err(UnknownValue::new("topic", s)),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Call(id) => write!(f, "call:{id}"),
            Topic::Huddle(id) => write!(f, "huddle:{id}"),
            Topic::Conversation(id) => write!(f, "conversation:{id}"),
            Topic::Phoenix => f.write_str("phoenix"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_prefixes() {
        assert_eq!("call:42".parse::<Topic>().unwrap(), Topic::call("42"));
        assert_eq!("huddle:h1".parse::<Topic>().unwrap(), Topic::huddle("h1"));
        assert_eq!(
            "conversation:c9".parse::<Topic>().unwrap(),
            Topic::conversation("c9")
        );
        assert_eq!("phoenix".parse::<Topic>().unwrap(), Topic::Phoenix);
    }

    #[test]
    fn rejects_unknown_and_empty() {
        assert!("presence:1".parse::<Topic>().is_err());
        assert!("call:".parse::<Topic>().is_err());
        assert!("call".parse::<Topic>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for raw in ["call:a", "huddle:b", "conversation:c", "phoenix"] {
            assert_eq!(raw.parse::<Topic>().unwrap().to_string(), raw);
        }
    }
}
