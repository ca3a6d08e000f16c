use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::store;
use crate::types::{AppState, Direction, MessageType};

/// Delivery of final reply text: provider-size-limited splitting, the
/// provider Messages API call, and the outbound audit log.

pub const DEFAULT_SEGMENT_LIMIT: usize = 4096;

/// Headroom reserved in each segment for the ` (i/n)` marker.
const MARKER_RESERVE: usize = 10;

/// Ordering on the recipient's device relies on sequential sends with a
/// small gap.
const INTER_SEGMENT_DELAY_MS: u64 = 500;

/// Split a reply into provider-sized segments using a paragraph, then
/// sentence, then word cascade. Never splits inside a word except for a
/// single word longer than the whole limit. Multi-segment results carry
/// ` (i/n)` markers.
pub fn split_reply(text: &str, limit: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let chunk_limit = limit.saturating_sub(MARKER_RESERVE).max(1);
    let chunks = split_paragraphs(text, chunk_limit);
    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("{} ({}/{})", chunk, i + 1, total))
        .collect()
}

fn split_paragraphs(text: &str, limit: usize) -> Vec<String> {
    let paragraphs: Vec<String> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .flat_map(|p| {
            if p.len() <= limit {
                vec![p.to_string()]
            } else {
                split_sentences(p, limit)
            }
        })
        .collect();
    pack(paragraphs, "\n\n", limit)
}

fn split_sentences(paragraph: &str, limit: usize) -> Vec<String> {
    let sentences: Vec<String> = sentence_boundaries(paragraph)
        .into_iter()
        .flat_map(|s| {
            if s.len() <= limit {
                vec![s]
            } else {
                split_words(&s, limit)
            }
        })
        .collect();
    pack(sentences, " ", limit)
}

fn split_words(sentence: &str, limit: usize) -> Vec<String> {
    let words: Vec<String> = sentence
        .split_whitespace()
        .flat_map(|w| {
            if w.len() <= limit {
                vec![w.to_string()]
            } else {
                hard_split(w, limit)
            }
        })
        .collect();
    pack(words, " ", limit)
}

/// Last resort for a single word longer than the limit.
fn hard_split(word: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in word.chars() {
        if current.len() + ch.len_utf8() > limit {
            out.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn sentence_boundaries(paragraph: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = paragraph.chars().peekable();
    while let Some(ch) = chars.next() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?')
            && chars.peek().map_or(true, |next| next.is_whitespace())
        {
            let sentence = current.trim().to_string();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            current.clear();
        }
    }
    let tail = current.trim().to_string();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Greedy packing of pieces (each already within the limit) into segments.
fn pack(pieces: Vec<String>, separator: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for piece in pieces {
        if current.is_empty() {
            current = piece;
            continue;
        }
        if current.len() + separator.len() + piece.len() <= limit {
            current.push_str(separator);
            current.push_str(&piece);
        } else {
            out.push(std::mem::take(&mut current));
            current = piece;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Send one message through the provider Messages API. Returns the
/// provider message sid.
pub async fn send_provider_message(
    state: &Arc<AppState>,
    to_phone: &str,
    body: &str,
) -> Result<String, String> {
    let provider = &state.config.provider;
    if provider.account_sid.is_empty() {
        return Err("provider account not configured".to_string());
    }
    let url = format!(
        "{}/2010-04-01/Accounts/{}/Messages.json",
        provider.api_base.trim_end_matches('/'),
        provider.account_sid
    );
    let to = channel_address(to_phone);
    let from = channel_address(&provider.from_number);
    let response = state
        .http
        .post(&url)
        .basic_auth(&provider.account_sid, Some(&provider.auth_token))
        .form(&[("To", to.as_str()), ("From", from.as_str()), ("Body", body)])
        .send()
        .await
        .map_err(|err| format!("provider send failed: {err}"))?;

    let status = response.status();
    let payload = response
        .json::<Value>()
        .await
        .unwrap_or_else(|_| Value::Null);
    if !status.is_success() {
        return Err(format!("provider returned {status}: {payload}"));
    }
    Ok(payload
        .get("sid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

fn channel_address(phone: &str) -> String {
    if phone.starts_with("whatsapp:") {
        phone.to_string()
    } else {
        format!("whatsapp:{phone}")
    }
}

/// Split, send sequentially, and log each segment as its own outbound
/// entry. Failures are logged and absorbed; the webhook has already been
/// acknowledged.
pub async fn dispatch_reply(
    state: &Arc<AppState>,
    seat_id: Option<&str>,
    phone: &str,
    text: &str,
    message_type: MessageType,
) {
    let segments = split_reply(text, state.config.segment_limit);
    let total = segments.len();
    for (i, segment) in segments.iter().enumerate() {
        let provider_sid = match send_provider_message(state, phone, segment).await {
            Ok(sid) => sid,
            Err(err) => {
                eprintln!("outbound send to {phone} failed: {err}");
                String::new()
            }
        };
        let entry = store::new_log_entry(
            seat_id,
            phone,
            Direction::Outbound,
            segment,
            message_type,
            &provider_sid,
        );
        if let Err(err) = store::insert_log(state, &entry).await {
            eprintln!("outbound log write failed: {err}");
        }
        if i + 1 < total {
            tokio::time::sleep(Duration::from_millis(INTER_SEGMENT_DELAY_MS)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn strip_marker(segment: &str) -> String {
        let re = Regex::new(r" \(\d+/\d+\)$").unwrap();
        re.replace(segment, "").to_string()
    }

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(split_reply("hello", 4096), vec!["hello".to_string()]);
        assert!(split_reply("   ", 4096).is_empty());
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let segments = split_reply(&text, 80);
        assert_eq!(segments.len(), 2);
        assert_eq!(strip_marker(&segments[0]), "a".repeat(60));
        assert_eq!(strip_marker(&segments[1]), "b".repeat(60));
    }

    #[test]
    fn falls_back_to_sentences_then_words() {
        let text = "First sentence here. Second sentence follows. Third one too.";
        let segments = split_reply(text, 30);
        assert!(segments.len() > 1);
        for segment in &segments {
            assert!(segment.len() <= 30, "segment too long: {segment}");
            let body = strip_marker(segment);
            // never a split inside a word
            for word in body.split_whitespace() {
                assert!(text.contains(word), "word mangled: {word}");
            }
        }
    }

    #[test]
    fn segments_respect_limit_and_rejoin() {
        let paragraph = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        let text = format!("{paragraph}\n\n{paragraph}");
        let limit = 200;
        let segments = split_reply(&text, limit);
        assert!(segments.len() > 1);
        for segment in &segments {
            assert!(segment.len() <= limit);
        }
        let rejoined = segments
            .iter()
            .map(|s| strip_marker(s))
            .collect::<Vec<_>>()
            .join(" ");
        let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(normalize(&rejoined), normalize(&text));
    }

    #[test]
    fn markers_count_all_segments() {
        let text = "word ".repeat(200);
        let segments = split_reply(&text, 100);
        let total = segments.len();
        for (i, segment) in segments.iter().enumerate() {
            assert!(segment.ends_with(&format!("({}/{})", i + 1, total)));
        }
    }

    #[test]
    fn oversized_single_word_is_hard_split() {
        let word = "x".repeat(250);
        let segments = split_reply(&word, 100);
        assert!(segments.len() > 1);
        for segment in &segments {
            assert!(segment.len() <= 100);
        }
        let rejoined: String = segments.iter().map(|s| strip_marker(s)).collect();
        assert_eq!(rejoined, word);
    }
}
