//! Normalization of upstream JSON payloads into [`MailRecord`]s.
//!
//! Upstream mail APIs disagree on envelope shape, field names and timestamp
//! formats. Everything here is lenient: unknown items are skipped with a log
//! line, missing timestamps fall back to "now".

use crate::error::FetchError;
use crate::model::MailRecord;
use crate::text::html_to_text;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::debug;

const SENDER_FIELDS: &[&str] = &["from", "sender", "from_address"];
const TEXT_FIELDS: &[&str] = &["content", "body", "text", "message", "content_preview"];
const HTML_FIELDS: &[&str] = &["html", "html_content", "htmlContent", "body_html"];
const TIME_FIELDS: &[&str] = &[
    "timestamp",
    "date",
    "receivedAt",
    "received_at",
    "time",
    "ts",
];

/// Values above this are treated as milliseconds since the epoch.
const MILLIS_THRESHOLD: f64 = 1e11;

/// Finds the mail list inside any of the supported envelopes.
///
/// Accepted shapes: `[..]`, `{emails:[..]}`, `{mails:[..]}`, `{data:[..]}`,
/// `{data:{emails:[..]}}` and `{data:{mails:[..]}}`.
pub(crate) fn mail_items(payload: &Value) -> Result<&[Value], FetchError> {
    fn list_in(object: &Map<String, Value>) -> Option<&[Value]> {
        ["emails", "mails", "messages"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_array))
            .map(Vec::as_slice)
    }

    match payload {
        Value::Array(items) => Ok(items),
        Value::Object(object) => {
            if let Some(items) = list_in(object) {
                return Ok(items);
            }
            match object.get("data") {
                Some(Value::Array(items)) => Ok(items),
                Some(Value::Object(data)) => list_in(data)
                    .ok_or_else(|| FetchError::payload("no mail list under 'data'")),
                Some(Value::Null) => Ok(&[]),
                _ => {
                    if let Some(message) = object.get("error").and_then(Value::as_str) {
                        Err(FetchError::payload(format!("upstream error: {message}")))
                    } else {
                        Err(FetchError::payload("no mail list in payload"))
                    }
                }
            }
        }
        Value::Null => Ok(&[]),
        _ => Err(FetchError::payload("payload is neither an object nor a list")),
    }
}

/// Converts a whole payload into mail records for `address`.
pub(crate) fn parse_mail_list(address: &str, payload: &Value) -> Result<Vec<MailRecord>, FetchError> {
    let items = mail_items(payload)?;
    let mails: Vec<MailRecord> = items
        .iter()
        .filter_map(|item| {
            let record = parse_mail_item(address, item);
            if record.is_none() {
                debug!(address, "Skipping mail item that is not an object");
            }
            record
        })
        .collect();

    debug!(address, items = items.len(), parsed = mails.len(), "Parsed mail payload");
    Ok(mails)
}

/// Converts one upstream item, or `None` if it is not an object.
pub(crate) fn parse_mail_item(address: &str, item: &Value) -> Option<MailRecord> {
    let object = item.as_object()?;

    let sender = first_string(object, SENDER_FIELDS).unwrap_or_default();
    let subject = first_string(object, &["subject"]).unwrap_or_default();
    let html = first_string(object, HTML_FIELDS).filter(|h| !h.trim().is_empty());
    let mut text = first_string(object, TEXT_FIELDS).unwrap_or_default();
    if text.trim().is_empty() {
        if let Some(html) = &html {
            text = html_to_text(html);
        }
    }

    let received_at = TIME_FIELDS
        .iter()
        .find_map(|key| object.get(*key).and_then(parse_timestamp))
        .unwrap_or_else(Utc::now);

    let mut record = MailRecord::new(address, sender, subject, text, received_at);
    if let Some(html) = html {
        record = record.with_html(html);
    }
    Some(record)
}

fn first_string(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.get(*key)? {
        Value::String(s) => Some(s.clone()),
        // Some APIs send `from` as {"address": .., "name": ..}
        Value::Object(inner) => inner
            .get("address")
            .or_else(|| inner.get("email"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    })
}

/// Parses a provider timestamp.
///
/// Numbers above `1e11` are milliseconds, smaller numbers seconds. Strings are
/// tried as a number, RFC 3339, naive ISO 8601 (taken as UTC) and RFC 2822.
pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(number) = raw.parse::<f64>() {
        return from_epoch(number);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[allow(clippy::cast_possible_truncation)]
fn from_epoch(number: f64) -> Option<DateTime<Utc>> {
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    let millis = if number > MILLIS_THRESHOLD {
        number
    } else {
        number * 1000.0
    };
    Utc.timestamp_millis_opt(millis as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mail_items_envelopes() {
        let item = json!({"subject": "s"});
        for payload in [
            json!([item.clone()]),
            json!({"emails": [item.clone()]}),
            json!({"data": [item.clone()]}),
            json!({"data": {"emails": [item.clone()]}}),
            json!({"data": {"mails": [item.clone()]}}),
        ] {
            assert_eq!(mail_items(&payload).unwrap().len(), 1, "{payload}");
        }

        assert!(mail_items(&json!({"data": null})).unwrap().is_empty());
        assert!(mail_items(&json!({"unexpected": true})).is_err());
        assert!(mail_items(&json!({"error": "rate limited"})).is_err());
        assert!(mail_items(&json!("nope")).is_err());
    }

    #[test]
    fn test_parse_mail_item_aliases() {
        let item = json!({
            "sender": "noreply@service.com",
            "subject": "Welcome",
            "body": "Your code is 123456",
            "receivedAt": "2024-05-01T10:00:00Z"
        });
        let mail = parse_mail_item("me@x.com", &item).unwrap();
        assert_eq!(mail.sender, "noreply@service.com");
        assert_eq!(mail.text_body, "Your code is 123456");
        assert_eq!(mail.received_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert!(mail.html_body.is_none());
    }

    #[test]
    fn test_parse_mail_item_derives_text_from_html() {
        let item = json!({
            "from": {"address": "bot@y.com", "name": "Bot"},
            "subject": "Code",
            "content": "",
            "htmlContent": "<p>Code: <b>7788</b></p>"
        });
        let mail = parse_mail_item("me@x.com", &item).unwrap();
        assert_eq!(mail.sender, "bot@y.com");
        assert_eq!(mail.text_body, "Code: 7788");
        assert!(mail.html_body.is_some());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        assert_eq!(parse_timestamp(&json!(1_704_164_645)), Some(expected));
        assert_eq!(parse_timestamp(&json!(1_704_164_645_000_i64)), Some(expected));
        assert_eq!(parse_timestamp(&json!("1704164645")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-01-02T03:04:05Z")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-01-02T03:04:05")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-01-02 03:04:05")), Some(expected));
        assert_eq!(
            parse_timestamp(&json!("Tue, 02 Jan 2024 03:04:05 +0000")),
            Some(expected)
        );
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
    }

    #[test]
    fn test_parse_mail_list_skips_non_objects() {
        let payload = json!({"emails": [{"subject": "a"}, 42, "junk", {"subject": "b"}]});
        let mails = parse_mail_list("me@x.com", &payload).unwrap();
        assert_eq!(mails.len(), 2);
    }
}
