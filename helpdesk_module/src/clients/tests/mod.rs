use super::merge::resolve_fields;
use super::*;
use tempfile::TempDir;

fn store(temp: &TempDir) -> ClientStore {
    ClientStore::new(temp.path().join("state").join("clients.db")).expect("client store")
}

fn new_client(name: &str, email: Option<&str>) -> NewClientRecord {
    NewClientRecord {
        name: name.to_string(),
        email: email.map(str::to_string),
        ..NewClientRecord::default()
    }
}

fn set_column(store: &ClientStore, id: i64, column: &str, value: Option<&str>) {
    let conn = store.open().unwrap();
    conn.execute(
        &format!("UPDATE clients SET {} = ?2 WHERE id = ?1", column),
        params![id, value],
    )
    .unwrap();
}

fn snapshot(store: &ClientStore) -> Vec<(i64, String, Option<String>, Option<String>, Option<i64>)> {
    let conn = store.open().unwrap();
    let mut stmt = conn
        .prepare("SELECT id, name, phone, deleted_at, merged_into FROM clients ORDER BY id")
        .unwrap();
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })
        .unwrap();
    rows.map(|row| row.unwrap()).collect()
}

#[test]
fn create_validates_and_normalizes() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);

    let created = store
        .create_client(&new_client("Dana Scully", Some(" Dana@FBI.example ")))
        .unwrap();
    assert_eq!(created.email.as_deref(), Some("dana@fbi.example"));
    assert_eq!(
        store.find_by_email("DANA@fbi.example").unwrap().map(|c| c.id),
        Some(created.id)
    );

    assert!(matches!(
        store.create_client(&new_client("  ", None)),
        Err(ClientStoreError::Validation { field: "name", .. })
    ));
    assert!(matches!(
        store.create_client(&new_client("Fox", Some("not-an-email"))),
        Err(ClientStoreError::Validation { field: "email", .. })
    ));
    assert!(matches!(
        store.create_client(&new_client("Other Dana", Some("dana@fbi.example"))),
        Err(ClientStoreError::Validation { field: "email", .. })
    ));
}

#[test]
fn tags_and_notes_attach_to_active_clients() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let client = store.create_client(&new_client("Dana", None)).unwrap();

    store.add_tag(client.id, "VIP").unwrap();
    let tags = store.add_tag(client.id, "vip ").unwrap();
    assert_eq!(tags, vec!["vip"]);

    store.add_note(client.id, "Prefers phone calls", Some("agent@helpdesk.example")).unwrap();
    let notes = store.list_notes(client.id).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].author.as_deref(), Some("agent@helpdesk.example"));

    assert!(matches!(
        store.add_note(999, "x", None),
        Err(ClientStoreError::NotFound(999))
    ));
}

#[test]
fn keep_primary_only_fills_empty_fields() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let primary = store.create_client(&new_client("Dana", Some("dana@a.example"))).unwrap();
    set_column(&store, primary.id, "phone", Some("555-0100"));
    let first = store.create_client(&new_client("Dana Scully", Some("dana@b.example"))).unwrap();
    set_column(&store, first.id, "phone", Some("555-0199"));
    set_column(&store, first.id, "company", Some("FBI"));
    let second = store.create_client(&new_client("D. Scully", None)).unwrap();
    set_column(&store, second.id, "company", Some("Federal Bureau"));
    set_column(&store, second.id, "city", Some("Washington"));

    let summary = store
        .merge_clients(primary.id, &[first.id, second.id], MergeStrategy::KeepPrimary)
        .unwrap();
    let merged = summary.primary;
    assert_eq!(merged.name, "Dana");
    assert_eq!(merged.email.as_deref(), Some("dana@a.example"));
    assert_eq!(merged.phone.as_deref(), Some("555-0100"));
    assert_eq!(merged.company.as_deref(), Some("FBI"));
    assert_eq!(merged.city.as_deref(), Some("Washington"));
    assert_eq!(summary.field_sources.get("company"), Some(&first.id));
    assert_eq!(summary.field_sources.get("city"), Some(&second.id));
    assert!(!summary.field_sources.contains_key("phone"));
}

#[test]
fn prefer_newest_and_prefer_complete_pick_winners() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let primary = store.create_client(&new_client("Dana", None)).unwrap();
    set_column(&store, primary.id, "phone", Some("555-0100"));
    set_column(&store, primary.id, "updated_at", Some("2024-01-01T00:00:00.000000Z"));
    let newer = store.create_client(&new_client("Dana Katherine Scully", None)).unwrap();
    set_column(&store, newer.id, "phone", Some("555-0199"));
    set_column(&store, newer.id, "updated_at", Some("2024-06-01T00:00:00.000000Z"));

    let primary = store.get_client(primary.id).unwrap().unwrap();
    let newer = store.get_client(newer.id).unwrap().unwrap();

    let newest = resolve_fields(&primary, &[newer.clone()], MergeStrategy::PreferNewest);
    assert_eq!(newest.get("phone"), Some(&(newer.id, "555-0199".to_string())));
    assert_eq!(
        newest.get("name"),
        Some(&(newer.id, "Dana Katherine Scully".to_string()))
    );

    let complete = resolve_fields(&primary, &[newer.clone()], MergeStrategy::PreferComplete);
    assert_eq!(
        complete.get("name"),
        Some(&(newer.id, "Dana Katherine Scully".to_string()))
    );
    // Equal length phones: the primary wins the tie.
    assert!(!complete.contains_key("phone"));

    let mut same_time = newer.clone();
    same_time.updated_at = primary.updated_at;
    let tied = resolve_fields(&primary, &[same_time], MergeStrategy::PreferNewest);
    assert!(!tied.contains_key("phone"));
}

#[test]
fn merge_moves_tags_notes_and_records_history() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let primary = store.create_client(&new_client("Dana", None)).unwrap();
    let other = store.create_client(&new_client("Dana S", Some("dana@b.example"))).unwrap();
    store.add_tag(primary.id, "vip").unwrap();
    store.add_tag(other.id, "vip").unwrap();
    store.add_tag(other.id, "billing").unwrap();
    store.add_note(other.id, "Called about invoice", None).unwrap();

    let summary = store
        .merge_clients(primary.id, &[other.id], MergeStrategy::KeepPrimary)
        .unwrap();
    assert_eq!(summary.tags_added, 1);
    assert_eq!(summary.notes_moved, 1);
    assert_eq!(summary.primary.tags, vec!["billing", "vip"]);
    assert_eq!(summary.primary.email.as_deref(), Some("dana@b.example"));
    assert_eq!(store.list_notes(primary.id).unwrap().len(), 1);

    let merged = store.get_client(other.id).unwrap().unwrap();
    assert!(merged.is_deleted());
    assert_eq!(merged.merged_into, Some(primary.id));
    assert_eq!(
        store.find_by_email("dana@b.example").unwrap().map(|c| c.id),
        Some(primary.id)
    );

    let history = store.merge_history(primary.id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].merged_client_id, other.id);
    assert_eq!(history[0].strategy, MergeStrategy::KeepPrimary);
    assert_eq!(history[0].fields_taken, vec!["email"]);
}

#[test]
fn merge_rejects_invalid_requests() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let primary = store.create_client(&new_client("Dana", None)).unwrap();
    let other = store.create_client(&new_client("Fox", None)).unwrap();
    let gone = store.create_client(&new_client("Alex", None)).unwrap();
    store
        .merge_clients(other.id, &[gone.id], MergeStrategy::KeepPrimary)
        .unwrap();

    let cases: Vec<(Vec<i64>, fn(&MergeError) -> bool)> = vec![
        (vec![], |err| matches!(err, MergeError::Empty)),
        (vec![primary.id], |err| matches!(err, MergeError::PrimaryInList(_))),
        (vec![other.id, other.id], |err| matches!(err, MergeError::DuplicateId(_))),
        (vec![4242], |err| matches!(err, MergeError::UnknownClient(4242))),
        (vec![gone.id], |err| matches!(err, MergeError::AlreadyDeleted(_))),
    ];
    for (ids, expected) in cases {
        match store.merge_clients(primary.id, &ids, MergeStrategy::KeepPrimary) {
            Err(ClientStoreError::Merge(err)) => assert!(expected(&err), "ids {:?} gave {:?}", ids, err),
            other => panic!("ids {:?} expected merge error, got {:?}", ids, other),
        }
    }
}

#[test]
fn failed_merge_leaves_no_partial_writes() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let primary = store.create_client(&new_client("Dana", None)).unwrap();
    let other = store.create_client(&new_client("Dana S", None)).unwrap();
    set_column(&store, other.id, "phone", Some("555-0199"));
    store.add_tag(other.id, "billing").unwrap();
    store.add_note(other.id, "note", None).unwrap();

    {
        let conn = store.open().unwrap();
        conn.execute_batch(
            "CREATE TRIGGER fail_merge_history BEFORE INSERT ON client_merges
             BEGIN SELECT RAISE(ABORT, 'history unavailable'); END;",
        )
        .unwrap();
    }
    let before = snapshot(&store);

    let err = store
        .merge_clients(primary.id, &[other.id], MergeStrategy::KeepPrimary)
        .unwrap_err();
    assert!(matches!(err, ClientStoreError::Sqlite(_)));

    assert_eq!(snapshot(&store), before);
    assert!(store.get_client(primary.id).unwrap().unwrap().tags.is_empty());
    assert!(store.list_notes(primary.id).unwrap().is_empty());
    assert_eq!(store.list_notes(other.id).unwrap().len(), 1);
    assert!(store.merge_history(primary.id).unwrap().is_empty());
}
