//! Quick-reply payloads. Up to three options become reply buttons, more
//! become a single-section list. Channels without interactive support get
//! the options as a numbered list appended to the text.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const MAX_BUTTONS: usize = 3;
pub const BUTTON_TITLE_MAX: usize = 20;
pub const ROW_TITLE_MAX: usize = 24;
pub const ROW_ID_MAX: usize = 200;
pub const LIST_BUTTON_LABEL: &str = "Options";

pub const META_INTERACTIVE: &str = "interactive";
pub const META_INTERACTIVE_TYPE: &str = "interactive_type";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickReply {
    pub id: String,
    pub title: String,
}

impl QuickReply {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Returns the payload and its kind (`button` or `list`).
pub fn build_payload(body: &str, replies: &[QuickReply]) -> (Value, &'static str) {
    if replies.len() <= MAX_BUTTONS {
        let buttons: Vec<Value> = replies
            .iter()
            .map(|r| {
                json!({
                    "type": "reply",
                    "reply": { "id": r.id, "title": truncate(&r.title, BUTTON_TITLE_MAX) },
                })
            })
            .collect();
        let payload = json!({
            "type": "button",
            "body": { "text": body },
            "action": { "buttons": buttons },
        });
        return (payload, "button");
    }

    let rows: Vec<Value> = replies
        .iter()
        .map(|r| {
            json!({
                "id": truncate(&r.id, ROW_ID_MAX),
                "title": truncate(&r.title, ROW_TITLE_MAX),
            })
        })
        .collect();
    let payload = json!({
        "type": "list",
        "body": { "text": body },
        "action": {
            "button": LIST_BUTTON_LABEL,
            "sections": [ { "rows": rows } ],
        },
    });
    (payload, "list")
}

/// Text fallback: the body followed by `1. title` lines.
pub fn numbered_list(body: &str, replies: &[QuickReply]) -> String {
    let mut text = body.to_string();
    if !text.is_empty() {
        text.push_str("\n\n");
    }
    let lines: Vec<String> = replies
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {}", i + 1, r.title))
        .collect();
    text.push_str(&lines.join("\n"));
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replies(n: usize) -> Vec<QuickReply> {
        (1..=n).map(|i| QuickReply::new(format!("opt{i}"), format!("Option {i}"))).collect()
    }

    #[test]
    fn two_options_become_buttons() {
        let (payload, kind) = build_payload("Pick one", &replies(2));
        assert_eq!(kind, "button");
        assert_eq!(payload["type"], "button");
        assert_eq!(payload["body"]["text"], "Pick one");
        let buttons = payload["action"]["buttons"].as_array().unwrap();
        assert_eq!(buttons.len(), 2);
        assert_eq!(buttons[0]["type"], "reply");
        assert_eq!(buttons[1]["reply"]["id"], "opt2");
    }

    #[test]
    fn five_options_become_a_list() {
        let (payload, kind) = build_payload("Pick one", &replies(5));
        assert_eq!(kind, "list");
        assert_eq!(payload["action"]["button"], "Options");
        let rows = payload["action"]["sections"][0]["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[4]["title"], "Option 5");
    }

    #[test]
    fn titles_are_truncated_by_characters() {
        let long = "abcdefghijklmnopqrstuvwxy";
        let (payload, _) = build_payload("x", &[QuickReply::new("a", long)]);
        assert_eq!(payload["action"]["buttons"][0]["reply"]["title"], "abcdefghijklmnopqrst");

        let mut many = replies(4);
        many[0].title = "ç".repeat(30);
        let (payload, _) = build_payload("x", &many);
        let title = payload["action"]["sections"][0]["rows"][0]["title"].as_str().unwrap();
        assert_eq!(title.chars().count(), ROW_TITLE_MAX);
    }

    #[test]
    fn numbered_fallback() {
        assert_eq!(
            numbered_list("Choose:", &replies(2)),
            "Choose:\n\n1. Option 1\n2. Option 2"
        );
    }
}
