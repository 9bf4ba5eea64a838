use super::*;
use chrono::{DateTime, Duration, TimeZone, Utc};
use shared::domain::{Author, MessageKind, UserId};

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().expect("ts") + Duration::minutes(minute)
}

fn message(id: &str, minute: i64) -> ChatMessage {
    ChatMessage {
        id: MessageId::from(id),
        author: Author {
            id: UserId::from("u1"),
            name: "Ana".into(),
            username: "ana".into(),
            avatar_url: String::new(),
        },
        content: serde_json::json!({ "type": "doc", "content": [] }),
        kind: MessageKind::Text,
        media_url: None,
        filename: None,
        reactions: Vec::new(),
        reply_preview: None,
        created_at: at(minute),
        updated_at: at(minute),
    }
}

fn ids(store: &MessageStore) -> Vec<&str> {
    store.messages().iter().map(|m| m.id.as_str()).collect()
}

#[test]
fn append_rejects_existing_id() {
    let mut store = MessageStore::new();
    assert!(store.append(message("m1", 0)));
    assert!(!store.append(message("m1", 5)));
    assert_eq!(store.len(), 1);
    assert_eq!(store.get(&MessageId::from("m1")).expect("m1").created_at, at(0));
}

#[test]
fn seed_drops_duplicate_ids_keeping_first() {
    let mut store = MessageStore::new();
    store.append(message("old", 0));
    store.seed(vec![message("m1", 1), message("m2", 2), message("m1", 3)]);
    assert_eq!(ids(&store), vec!["m1", "m2"]);
    assert!(!store.contains(&MessageId::from("old")));
}

#[test]
fn history_precedes_live_messages_in_receipt_order() {
    let mut store = MessageStore::new();
    store.seed(vec![message("h1", 0), message("h2", 1)]);
    // live receipt order differs from timestamp order on purpose
    store.append(message("l2", 9));
    store.append(message("l1", 8));
    assert_eq!(ids(&store), vec!["h1", "h2", "l2", "l1"]);
}

#[test]
fn duplicate_delivery_via_history_and_live_collapses() {
    let mut store = MessageStore::new();
    store.seed(vec![message("m1", 0)]);
    assert!(!store.append(message("m1", 0)));
    assert_eq!(ids(&store), vec!["m1"]);
}

#[test]
fn dedup_holds_for_arbitrary_sequences() {
    let mut store = MessageStore::new();
    let script = ["a", "b", "a", "c", "b", "b", "d", "a"];
    for (i, id) in script.iter().enumerate() {
        if i % 3 == 0 {
            let mut seeded = store.snapshot();
            seeded.push(message(id, i as i64));
            seeded.push(message(id, i as i64));
            store.seed(seeded);
        } else {
            store.append(message(id, i as i64));
        }
        let unique: HashSet<&MessageId> = store.messages().iter().map(|m| &m.id).collect();
        assert_eq!(unique.len(), store.len());
    }
    assert_eq!(ids(&store), vec!["a", "b", "c", "d"]);
}

#[test]
fn replace_keeps_position_and_ignores_unknown_ids() {
    let mut store = MessageStore::new();
    store.seed(vec![message("m1", 0), message("m2", 1)]);

    let mut edited = message("m1", 0);
    edited.updated_at = at(30);
    assert!(store.replace(&MessageId::from("m1"), edited.clone()));
    assert_eq!(ids(&store), vec!["m1", "m2"]);
    assert_eq!(store.messages()[0], edited);

    assert!(!store.replace(&MessageId::from("nope"), message("nope", 2)));
    assert_eq!(store.len(), 2);
}

#[test]
fn replace_with_new_id_rekeys_entry() {
    let mut store = MessageStore::new();
    store.seed(vec![message("local-1", 0), message("m2", 1)]);
    assert!(store.replace(&MessageId::from("local-1"), message("server-1", 0)));
    assert_eq!(ids(&store), vec!["server-1", "m2"]);
    assert!(!store.contains(&MessageId::from("local-1")));
    assert!(!store.append(message("server-1", 0)));
}

#[test]
fn replace_with_already_present_id_drops_placeholder() {
    let mut store = MessageStore::new();
    store.seed(vec![message("local-1", 0), message("server-1", 1)]);
    assert!(store.replace(&MessageId::from("local-1"), message("server-1", 1)));
    assert_eq!(ids(&store), vec!["server-1"]);
}

#[test]
fn remove_deletes_entry_once() {
    let mut store = MessageStore::new();
    store.seed(vec![message("m1", 0), message("m2", 1)]);
    assert!(store.remove(&MessageId::from("m1")));
    assert!(!store.remove(&MessageId::from("m1")));
    assert_eq!(ids(&store), vec!["m2"]);
    assert!(store.append(message("m1", 0)));
}

#[test]
fn merge_prefers_fresh_records_for_overlapping_ids() {
    let mut cached = message("m2", 2);
    cached.reactions.push(shared::domain::Reaction {
        emoji: "👍".into(),
        user_id: UserId::from("u9"),
    });
    let fresh = vec![message("m2", 2), message("m3", 3)];

    let merged = merge_history(fresh, &[cached]);
    assert_eq!(merged.len(), 2);
    assert!(merged[0].reactions.is_empty());
}

#[test]
fn merge_keeps_cache_only_records_around_the_window() {
    let local = vec![
        message("old", 0),
        message("m2", 2),
        message("live", 10),
    ];
    let fresh = vec![message("m2", 2), message("m3", 3)];

    let merged: Vec<String> = merge_history(fresh, &local)
        .into_iter()
        .map(|m| m.id.0)
        .collect();
    assert_eq!(merged, vec!["old", "m2", "m3", "live"]);
}

#[test]
fn merge_with_empty_history_keeps_local_log() {
    let local = vec![message("a", 0), message("b", 1)];
    let merged = merge_history(Vec::new(), &local);
    assert_eq!(merged, local);
}
