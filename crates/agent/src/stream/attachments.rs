//! `<attachments>` block extraction.
//!
//! The model lists deliverables in a block like
//!
//! ```text
//! <attachments>
//! - /shared/report.pdf
//! - https://example.com/chart.png
//! </attachments>
//! ```
//!
//! which must reach the client as attachments, never as visible text. While
//! streaming, the block can be split across any number of deltas, so the
//! extractor buffers whatever might still turn into a tag.

use std::collections::HashSet;

use skein_core::attachment::Attachment;
use skein_core::message::{ContentPart, MessageContent, ModelMessage, Role};

const OPEN_TAG: &str = "<attachments>";
const CLOSE_TAG: &str = "</attachments>";

/// Visible text and attachments recovered from one piece of input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub visible_text: String,
    pub attachments: Vec<Attachment>,
}

/// Incremental extractor for text arriving in deltas.
#[derive(Debug, Default)]
pub struct AttachmentsStreamExtractor {
    buffer: String,
    in_block: bool,
}

impl AttachmentsStreamExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta. Text that could still be the start of an opening tag
    /// is held back until the next call.
    pub fn push(&mut self, delta: &str) -> Extracted {
        self.buffer.push_str(delta);
        let mut out = Extracted::default();

        loop {
            if self.in_block {
                let Some(end) = self.buffer.find(CLOSE_TAG) else {
                    break;
                };
                out.attachments.extend(parse_block(&self.buffer[..end]));
                self.buffer.drain(..end + CLOSE_TAG.len());
                self.in_block = false;
            } else if let Some(start) = self.buffer.find(OPEN_TAG) {
                out.visible_text.push_str(&self.buffer[..start]);
                self.buffer.drain(..start + OPEN_TAG.len());
                self.in_block = true;
            } else {
                let emit_to = self.buffer.len() - partial_tag_len(&self.buffer);
                out.visible_text.push_str(&self.buffer[..emit_to]);
                self.buffer.drain(..emit_to);
                break;
            }
        }
        out
    }

    /// Release everything still buffered. An unclosed block is parsed as
    /// attachments rather than leaked as text.
    pub fn flush_remainder(&mut self) -> Extracted {
        let rest = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.in_block) {
            Extracted {
                visible_text: String::new(),
                attachments: parse_block(&rest),
            }
        } else {
            Extracted {
                visible_text: rest,
                attachments: Vec::new(),
            }
        }
    }
}

/// Length of the longest suffix of `buffer` that is a proper prefix of the
/// opening tag.
fn partial_tag_len(buffer: &str) -> usize {
    (1..OPEN_TAG.len())
        .rev()
        .find(|&k| buffer.ends_with(&OPEN_TAG[..k]))
        .unwrap_or(0)
}

fn parse_block(block: &str) -> Vec<Attachment> {
    block.lines().filter_map(Attachment::from_line).collect()
}

/// Remove every attachments block from a complete text.
///
/// Surrounding whitespace is trimmed from the result.
pub fn extract_attachments_from_text(text: &str) -> Extracted {
    let mut extractor = AttachmentsStreamExtractor::new();
    let mut out = extractor.push(text);
    let rest = extractor.flush_remainder();
    out.visible_text.push_str(&rest.visible_text);
    out.attachments.extend(rest.attachments);
    out.visible_text = out.visible_text.trim().to_string();
    out
}

/// Strip attachments blocks from assistant text in `messages`.
///
/// Returns the cleaned messages and the deduplicated attachments found.
pub fn strip_attachments_from_messages(
    messages: Vec<ModelMessage>,
) -> (Vec<ModelMessage>, Vec<Attachment>) {
    let mut found = Vec::new();
    let cleaned = messages
        .into_iter()
        .map(|mut msg| {
            if msg.role != Role::Assistant {
                return msg;
            }
            match &mut msg.content {
                MessageContent::Text(text) => {
                    let extracted = extract_attachments_from_text(text);
                    *text = extracted.visible_text;
                    found.extend(extracted.attachments);
                }
                MessageContent::Parts(parts) => {
                    for part in parts.iter_mut() {
                        if let ContentPart::Text { text } = part {
                            let extracted = extract_attachments_from_text(text);
                            *text = extracted.visible_text;
                            found.extend(extracted.attachments);
                        }
                    }
                }
            }
            msg
        })
        .collect();
    (cleaned, dedupe_attachments(found))
}

/// Drop repeated attachments, keeping first occurrence order.
pub fn dedupe_attachments(attachments: Vec<Attachment>) -> Vec<Attachment> {
    let mut seen = HashSet::new();
    attachments
        .into_iter()
        .filter(|a| seen.insert(a.clone()))
        .collect()
}
