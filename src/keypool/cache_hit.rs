// src/keypool/cache_hit.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Minimum serialized size of `messages` before affinity kicks in.
pub const MIN_MESSAGES_BYTES: usize = 4096;
/// Minimum number of messages before affinity kicks in.
pub const MIN_MESSAGES_COUNT: usize = 3;
/// Suffix lengths dropped when probing for an earlier conversation turn.
pub const DROP_COUNTS: [usize; 3] = [2, 4, 6];

/// Store-side value of one affinity entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHitEntry {
    pub key_id: i64,
    pub exp_time: i64,
}

/// Pulls the `messages` array out of a request body, returning the array and
/// its serialized byte size. `None` when the body is not JSON or has no array.
pub fn extract_messages(body: &[u8]) -> Option<(Vec<Value>, usize)> {
    #[derive(Deserialize)]
    struct Body {
        messages: Vec<Value>,
    }
    let parsed: Body = serde_json::from_slice(body).ok()?;
    let size = serde_json::to_vec(&parsed.messages).map(|v| v.len()).unwrap_or(0);
    Some((parsed.messages, size))
}

/// Hash of the conversation prefix `messages[..len - drop_count]` with every
/// `cache_control` key stripped, so cache-marker churn does not defeat
/// affinity. Returns `None` when dropping leaves nothing.
///
/// The digest is SHA-256 truncated to 32 hex characters.
pub fn prompt_hash(messages: &[Value], drop_count: usize) -> Option<String> {
    if drop_count >= messages.len() {
        return None;
    }
    let truncated = &messages[..messages.len() - drop_count];
    if truncated.is_empty() {
        return None;
    }
    let cleaned: Vec<Value> = truncated.iter().map(strip_cache_control).collect();
    let data = serde_json::to_vec(&cleaned).ok()?;
    let digest = Sha256::digest(&data);
    Some(hex::encode(&digest[..16]))
}

/// Returns a copy of the message with `cache_control` removed from the message
/// object and from each content block. The input is never mutated.
fn strip_cache_control(message: &Value) -> Value {
    let Some(obj) = message.as_object() else {
        return message.clone();
    };

    let mut cleaned = obj.clone();
    cleaned.remove("cache_control");

    if let Some(Value::Array(blocks)) = cleaned.get("content") {
        let new_blocks: Vec<Value> = blocks
            .iter()
            .map(|block| match block.as_object() {
                Some(block_obj) if block_obj.contains_key("cache_control") => {
                    let mut copy = block_obj.clone();
                    copy.remove("cache_control");
                    Value::Object(copy)
                }
                _ => block.clone(),
            })
            .collect();
        cleaned.insert("content".to_string(), Value::Array(new_blocks));
    }

    Value::Object(cleaned)
}

/// Affinity preconditions from the request body: enabled, `messages` present,
/// serialized size strictly over 4 KiB, and at least 3 messages.
pub fn affinity_candidate(body: &[u8]) -> Option<Vec<Value>> {
    let (messages, size) = extract_messages(body)?;
    if size <= MIN_MESSAGES_BYTES || messages.len() < MIN_MESSAGES_COUNT {
        return None;
    }
    Some(messages)
}
