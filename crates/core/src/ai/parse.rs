//! Reply parsing.
//!
//! Models wrap JSON in prose or code fences, so the outermost `{...}` span
//! is extracted before decoding.

use crate::error::AiError;
use crate::models::Member;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A typed reply from one member.
pub trait MemberReply: DeserializeOwned {
    /// Semantic checks beyond the JSON shape.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// The outermost JSON object in `text`.
pub fn extract_json(text: &str) -> Option<Value> {
    serde_json::from_str(object_span(text)?).ok()
}

fn object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

pub fn parse_reply<T: MemberReply>(member: Member, text: &str) -> Result<T, AiError> {
    let value = extract_json(text).ok_or_else(|| AiError::Parse {
        member: member.to_string(),
        reason: if object_span(text).is_some() {
            "reply contains malformed JSON".to_string()
        } else {
            "no JSON object in reply".to_string()
        },
    })?;

    let reply: T = serde_json::from_value(value).map_err(|e| AiError::Validation {
        member: member.to_string(),
        reason: e.to_string(),
    })?;

    reply.validate().map_err(|reason| AiError::Validation {
        member: member.to_string(),
        reason,
    })?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Verdict {
        status: String,
    }

    impl MemberReply for Verdict {
        fn validate(&self) -> Result<(), String> {
            match self.status.as_str() {
                "pass" | "reject" => Ok(()),
                other => Err(format!("unknown status `{other}`")),
            }
        }
    }

    #[test]
    fn test_extracts_from_fenced_prose() {
        let text = "Here you go:\n```json\n{\"status\": \"pass\", \"n\": {\"x\": 1}}\n```\nThanks";
        let value = extract_json(text).unwrap();
        assert_eq!(value["n"]["x"], 1);
    }

    #[test]
    fn test_parse_errors_are_typed() {
        let err = parse_reply::<Verdict>(Member::Critic, "no json here").unwrap_err();
        assert!(matches!(err, AiError::Parse { .. }));

        let err = parse_reply::<Verdict>(Member::Critic, "{status: pass}").unwrap_err();
        assert!(matches!(err, AiError::Parse { .. }));

        let err = parse_reply::<Verdict>(Member::Critic, r#"{"verdict": "ok"}"#).unwrap_err();
        assert!(matches!(err, AiError::Validation { .. }));

        let err = parse_reply::<Verdict>(Member::Critic, r#"{"status": "maybe"}"#).unwrap_err();
        assert!(matches!(err, AiError::Validation { ref reason, .. } if reason.contains("maybe")));
    }

    #[test]
    fn test_parse_valid_reply() {
        let verdict = parse_reply::<Verdict>(Member::Critic, r#"{"status": "reject"}"#).unwrap();
        assert_eq!(verdict.status, "reject");
    }
}
