//! Input framing on the agent stream.
//!
//! Terminal bytes travel as plain text frames with no tag. Control messages
//! are JSON objects; the agent treats a frame as control only when it looks
//! like a JSON object and parses as a known envelope.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Resize { rows: u16, cols: u16 },
}

impl ControlMessage {
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Control(ControlMessage),
    Terminal(&'a str),
}

impl<'a> Frame<'a> {
    pub fn classify(text: &'a str) -> Self {
        if text.starts_with('{')
            && text.ends_with('}')
            && let Ok(msg) = serde_json::from_str::<ControlMessage>(text)
        {
            return Frame::Control(msg);
        }
        Frame::Terminal(text)
    }
}
