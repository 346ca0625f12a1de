//! Snapshot payload normalization
//!
//! Pure function from the raw backend document to a [`NormalizedSnapshot`].
//! The backend's field naming is authoritative and has shipped both
//! snake_case and camelCase over time, so every lookup goes through alias
//! lists. The parser only fails when the payload is not an object; missing
//! or malformed fields degrade to defaults.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;

use hexmon_common::model::{
    FitMode, ItemType, NormalizedSnapshot, TimelineItem, DEFAULT_DISPLAY_MS,
};
use hexmon_common::{Error, Result};

/// First present field among `keys`, as a string
pub fn opt_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(k))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// First present field among `keys`, as a u64
pub fn opt_u64(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| value.get(k)).and_then(|v| v.as_u64())
}

/// First present field among `keys`, as a bool
pub fn opt_bool(value: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter()
        .find_map(|k| value.get(k))
        .and_then(|v| v.as_bool())
}

fn opt_value<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| value.get(k))
}

/// Normalize one backend snapshot payload.
///
/// Fails with [`Error::Parse`] only when `raw` is not a JSON object.
pub fn parse_snapshot_response(raw: &Value) -> Result<NormalizedSnapshot> {
    if !raw.is_object() {
        return Err(Error::Parse("snapshot payload is not an object".to_string()));
    }

    let media_url_map = extract_media_urls(raw);

    let schedule = opt_value(raw, &["schedule"]);
    let schedule_id = schedule
        .and_then(|s| opt_str(s, &["id", "schedule_id", "scheduleId"]))
        .or_else(|| opt_str(raw, &["schedule_id", "scheduleId"]));
    let snapshot_id = opt_str(raw, &["snapshot_id", "snapshotId", "id"]);

    let raw_items = schedule
        .and_then(|s| opt_value(s, &["items"]))
        .or_else(|| opt_value(raw, &["items"]))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let items: Vec<TimelineItem> = raw_items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| parse_item(item, index, &media_url_map))
        .collect();

    let emergency_item = opt_value(raw, &["emergency"]).and_then(|e| {
        let active = opt_bool(e, &["active"]).unwrap_or(false);
        let has_url = opt_str(e, &["media_url", "mediaUrl", "url"]).is_some();
        if active || has_url {
            parse_item(e, usize::MAX, &media_url_map)
        } else {
            None
        }
    });

    let default_item = opt_value(raw, &["default_media", "defaultMedia", "default"])
        .and_then(|d| parse_item(d, usize::MAX, &media_url_map));

    Ok(NormalizedSnapshot {
        snapshot_id,
        schedule_id,
        items,
        emergency_item,
        default_item,
        media_url_map,
        fetched_at: Utc::now(),
        raw: raw.clone(),
    })
}

/// Collect `media_urls` maps and inline `media[]` arrays into one
/// mediaId -> signed URL map
fn extract_media_urls(raw: &Value) -> HashMap<String, String> {
    let mut map = HashMap::new();

    if let Some(urls) = opt_value(raw, &["media_urls", "mediaUrls"]).and_then(|v| v.as_object()) {
        for (id, url) in urls {
            if let Some(url) = url.as_str() {
                map.insert(id.clone(), url.to_string());
            }
        }
    }

    if let Some(media) = opt_value(raw, &["media"]).and_then(|v| v.as_array()) {
        for entry in media {
            let id = opt_str(entry, &["id", "media_id", "mediaId"]);
            let url = opt_str(entry, &["url", "media_url", "mediaUrl", "download_url", "downloadUrl"]);
            if let (Some(id), Some(url)) = (id, url) {
                map.entry(id).or_insert(url);
            }
        }
    }

    map
}

/// Parse one item object; None when it is unusable (not an object)
fn parse_item(
    item: &Value,
    index: usize,
    media_url_map: &HashMap<String, String>,
) -> Option<TimelineItem> {
    if !item.is_object() {
        return None;
    }

    let media_id = opt_str(item, &["media_id", "mediaId"]);
    let remote_url = opt_str(item, &["media_url", "mediaUrl", "url"]).or_else(|| {
        media_id
            .as_ref()
            .and_then(|id| media_url_map.get(id).cloned())
    });

    let id = opt_str(item, &["id", "item_id", "itemId"]).unwrap_or_else(|| {
        if index == usize::MAX {
            media_id.clone().unwrap_or_else(|| "item".to_string())
        } else {
            format!("item-{index}")
        }
    });

    // Explicit type wins; otherwise infer from the URL extension
    let item_type = opt_str(item, &["type", "media_type", "mediaType"])
        .and_then(|t| match t.to_ascii_lowercase().as_str() {
            "image" => Some(ItemType::Image),
            "video" => Some(ItemType::Video),
            "pdf" | "document" => Some(ItemType::Pdf),
            "url" | "web" => Some(ItemType::Url),
            _ => None,
        })
        .or_else(|| remote_url.as_deref().map(ItemType::infer_from_url))
        .unwrap_or(ItemType::Image);

    let display_ms = match opt_u64(item, &["display_ms", "displayMs", "duration_ms", "durationMs"])
    {
        Some(ms) if ms >= 1 => ms,
        _ => DEFAULT_DISPLAY_MS,
    };

    let fit = opt_str(item, &["fit"])
        .map(|f| FitMode::parse(&f))
        .unwrap_or_default();

    Some(TimelineItem {
        id,
        media_id,
        item_type,
        remote_url,
        local_path: None,
        local_url: None,
        display_ms,
        fit,
        muted: opt_bool(item, &["muted"]).unwrap_or(false),
        sha256: opt_str(item, &["sha256", "checksum"]),
        transition_duration_ms: opt_u64(
            item,
            &["transition_duration_ms", "transitionDurationMs"],
        )
        .unwrap_or(0),
        meta: opt_value(item, &["meta", "metadata"])
            .cloned()
            .unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(
            parse_snapshot_response(&json!([1, 2])),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            parse_snapshot_response(&json!("nope")),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_two_item_schedule() {
        // Second item omits display_ms and type; both get defaults
        let raw = json!({
            "schedule": {
                "id": "s1",
                "items": [
                    {"id": "i1", "media_id": "m1", "media_url": "https://u/1.png", "display_ms": 5000},
                    {"id": "i2", "media_id": "m2", "media_url": "https://u/2.mp4"}
                ]
            }
        });
        let snapshot = parse_snapshot_response(&raw).unwrap();

        assert_eq!(snapshot.schedule_id.as_deref(), Some("s1"));
        assert_eq!(snapshot.items.len(), 2);
        assert_eq!(snapshot.items[0].display_ms, 5000);
        assert_eq!(snapshot.items[0].item_type, ItemType::Image);
        assert_eq!(snapshot.items[1].display_ms, DEFAULT_DISPLAY_MS);
        assert_eq!(snapshot.items[1].item_type, ItemType::Video);
        assert!(snapshot.emergency_item.is_none());
    }

    #[test]
    fn test_camel_case_payload() {
        let raw = json!({
            "schedule": {
                "scheduleId": "s2",
                "items": [
                    {"id": "i1", "mediaId": "m1", "mediaUrl": "https://u/1.webm",
                     "displayMs": 7000, "transitionDurationMs": 400}
                ]
            }
        });
        let snapshot = parse_snapshot_response(&raw).unwrap();
        assert_eq!(snapshot.schedule_id.as_deref(), Some("s2"));
        let item = &snapshot.items[0];
        assert_eq!(item.media_id.as_deref(), Some("m1"));
        assert_eq!(item.display_ms, 7000);
        assert_eq!(item.transition_duration_ms, 400);
        assert_eq!(item.item_type, ItemType::Video);
    }

    #[test]
    fn test_media_url_map_and_inline_media() {
        let raw = json!({
            "media_urls": {"m1": "https://signed/1.png"},
            "media": [
                {"id": "m2", "url": "https://signed/2.mp4"},
                {"id": "m1", "url": "https://other/1.png"}
            ],
            "items": [
                {"id": "i1", "media_id": "m1"},
                {"id": "i2", "media_id": "m2"}
            ]
        });
        let snapshot = parse_snapshot_response(&raw).unwrap();

        // media_urls entries win over inline media with the same id
        assert_eq!(snapshot.media_url_map["m1"], "https://signed/1.png");
        assert_eq!(snapshot.media_url_map["m2"], "https://signed/2.mp4");
        // Items without their own URL pick it up from the map
        assert_eq!(
            snapshot.items[0].remote_url.as_deref(),
            Some("https://signed/1.png")
        );
        assert_eq!(snapshot.items[1].item_type, ItemType::Video);
    }

    #[test]
    fn test_emergency_requires_active_or_url() {
        let inactive = json!({
            "emergency": {"active": false, "media_id": "em1"},
            "schedule": {"items": []}
        });
        assert!(parse_snapshot_response(&inactive)
            .unwrap()
            .emergency_item
            .is_none());

        let active = json!({
            "emergency": {"active": true, "media_url": "https://u/e.mp4", "media_id": "em1"},
            "schedule": {"items": [{"id": "i1", "media_id": "m1"}]}
        });
        let snapshot = parse_snapshot_response(&active).unwrap();
        let emergency = snapshot.emergency_item.unwrap();
        assert_eq!(emergency.media_id.as_deref(), Some("em1"));
        assert_eq!(emergency.item_type, ItemType::Video);

        // A URL alone activates the override
        let url_only = json!({
            "emergency": {"media_url": "https://u/e.png"}
        });
        assert!(parse_snapshot_response(&url_only)
            .unwrap()
            .emergency_item
            .is_some());
    }

    #[test]
    fn test_display_ms_zero_clamped() {
        let raw = json!({
            "items": [{"id": "i1", "media_id": "m1", "display_ms": 0}]
        });
        let snapshot = parse_snapshot_response(&raw).unwrap();
        assert_eq!(snapshot.items[0].display_ms, DEFAULT_DISPLAY_MS);
    }

    #[test]
    fn test_fit_normalization_and_defaults() {
        let raw = json!({
            "items": [
                {"id": "i1", "media_id": "m1", "fit": "COVER"},
                {"id": "i2", "media_id": "m2", "fit": "diagonal"},
                {"id": "i3", "media_id": "m3"}
            ]
        });
        let snapshot = parse_snapshot_response(&raw).unwrap();
        assert_eq!(snapshot.items[0].fit, FitMode::Cover);
        assert_eq!(snapshot.items[1].fit, FitMode::Contain);
        assert_eq!(snapshot.items[2].fit, FitMode::Contain);
    }

    #[test]
    fn test_reparse_is_idempotent() {
        let raw = json!({
            "schedule": {
                "id": "s1",
                "items": [
                    {"id": "i1", "media_id": "m1", "media_url": "https://u/1.png"},
                    {"id": "i2", "media_id": "m2", "media_url": "https://u/2.pdf", "display_ms": 4000}
                ]
            },
            "media_urls": {"m1": "https://signed/1.png"}
        });

        let first = parse_snapshot_response(&raw).unwrap();
        // The raw payload is preserved verbatim, so parsing it again must
        // produce the same normalization.
        let second = parse_snapshot_response(&first.raw).unwrap();

        assert_eq!(first.schedule_id, second.schedule_id);
        assert_eq!(first.items.len(), second.items.len());
        for (a, b) in first.items.iter().zip(second.items.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.media_id, b.media_id);
            assert_eq!(a.item_type, b.item_type);
            assert_eq!(a.display_ms, b.display_ms);
            assert_eq!(a.remote_url, b.remote_url);
        }
        assert_eq!(first.media_url_map, second.media_url_map);
    }

    #[test]
    fn test_item_order_preserved() {
        let ids: Vec<String> = (0..10).map(|i| format!("i{i}")).collect();
        let items: Vec<Value> = ids
            .iter()
            .map(|id| json!({"id": id, "media_id": format!("m-{id}")}))
            .collect();
        let raw = json!({"schedule": {"items": items}});

        let snapshot = parse_snapshot_response(&raw).unwrap();
        let parsed_ids: Vec<&str> = snapshot.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(parsed_ids, ids.iter().map(String::as_str).collect::<Vec<_>>());
    }
}
