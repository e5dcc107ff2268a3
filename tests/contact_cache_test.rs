use std::fs;
use tempfile::tempdir;

use imsg_gateway::contacts::ContactCache;
use imsg_gateway::models::{ContactResolution, ContactUpsert};

fn upsert(name: Option<&str>, phones: &[&str], emails: &[&str]) -> ContactUpsert {
    ContactUpsert {
        name: name.map(str::to_string),
        phones: phones.iter().map(|p| (*p).to_string()).collect(),
        emails: emails.iter().map(|e| (*e).to_string()).collect(),
        aliases: Vec::new(),
    }
}

#[test]
fn test_upsert_merges_on_phone_and_keeps_id() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let cache = ContactCache::open(temp_dir.path().join("contacts.json"));

    let first = cache
        .upsert(upsert(Some("Test Person"), &["+1 (555) 123-4567"], &[]))
        .expect("Failed to add contact");

    // Same number, different formatting
    let second = cache
        .upsert(upsert(None, &["15551234567", "+1-555-123-4567"], &["test@example.com"]))
        .expect("Failed to update contact");

    assert_eq!(second.id, first.id);
    assert_eq!(second.name.as_deref(), Some("Test Person"));
    assert!(second.emails.contains("test@example.com"));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_upsert_merges_on_email_case_insensitively() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let cache = ContactCache::open(temp_dir.path().join("contacts.json"));

    let first = cache.upsert(upsert(Some("Ann"), &[], &["Ann@Example.com"])).unwrap();
    let second = cache.upsert(upsert(Some("Ann Lee"), &[], &["ann@example.com"])).unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.name.as_deref(), Some("Ann Lee"));
}

#[test]
fn test_resolve_precedence_phone_then_email_then_name() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let cache = ContactCache::open(temp_dir.path().join("contacts.json"));

    let by_phone = cache.upsert(upsert(Some("Phone Owner"), &["+15550001111"], &[])).unwrap();
    let by_email = cache.upsert(upsert(Some("Mail Owner"), &[], &["mail@example.com"])).unwrap();

    match cache.resolve(Some("+1 555 000 1111"), Some("mail@example.com"), Some("Mail Owner")) {
        ContactResolution::Ok { contact } => assert_eq!(contact.id, by_phone.id),
        other => panic!("expected ok, got {other:?}"),
    }

    match cache.resolve(Some("+19999999999"), Some("MAIL@example.com"), None) {
        ContactResolution::Ok { contact } => assert_eq!(contact.id, by_email.id),
        other => panic!("expected ok, got {other:?}"),
    }
}

#[test]
fn test_resolve_partial_name_is_ambiguous() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let cache = ContactCache::open(temp_dir.path().join("contacts.json"));

    cache.upsert(upsert(Some("John Doe"), &["+15550000001"], &[])).unwrap();
    cache.upsert(upsert(Some("John Smith"), &["+15550000002"], &[])).unwrap();

    match cache.resolve(None, None, Some("John")) {
        ContactResolution::Ambiguous { candidates } => {
            let mut names: Vec<_> = candidates.iter().filter_map(|c| c.name.clone()).collect();
            names.sort();
            assert_eq!(names, vec!["John Doe", "John Smith"]);
        },
        other => panic!("expected ambiguous, got {other:?}"),
    }

    match cache.resolve(None, None, Some("john doe")) {
        ContactResolution::Ok { contact } => assert_eq!(contact.name.as_deref(), Some("John Doe")),
        other => panic!("expected ok, got {other:?}"),
    }
}

#[test]
fn test_resolve_by_alias() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let cache = ContactCache::open(temp_dir.path().join("contacts.json"));

    let mom = cache
        .upsert(ContactUpsert {
            name: Some("Margaret".to_string()),
            phones: vec!["+15550002222".to_string()],
            emails: Vec::new(),
            aliases: vec!["Mom".to_string()],
        })
        .unwrap();

    assert_eq!(cache.resolve(None, None, Some("mom")), ContactResolution::Ok { contact: mom });
}

#[test]
fn test_resolve_not_found_and_blank_keys() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let cache = ContactCache::open(temp_dir.path().join("contacts.json"));
    cache.upsert(upsert(Some("Someone"), &["+15550003333"], &[])).unwrap();

    assert_eq!(cache.resolve(Some("+15559999999"), None, None), ContactResolution::NotFound);
    assert_eq!(cache.resolve(Some(""), Some(" "), Some("  ")), ContactResolution::NotFound);
    assert_eq!(cache.resolve(None, None, None), ContactResolution::NotFound);
}

#[test]
fn test_persistence_round_trip() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let path = temp_dir.path().join("nested").join("contacts.json");

    let created = {
        let cache = ContactCache::open(&path);
        cache.upsert(upsert(Some("Persisted"), &["+15550004444"], &["p@example.com"])).unwrap()
    };

    assert!(path.exists());
    let reopened = ContactCache::open(&path);
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.get(&created.id), Some(created));

    match reopened.resolve(Some("5550004444"), None, None) {
        ContactResolution::NotFound => {},
        other => panic!("a number without the leading + is a different key, got {other:?}"),
    }
    assert!(matches!(
        reopened.resolve(Some("+1 555 000 4444"), None, None),
        ContactResolution::Ok { .. }
    ));
}

#[test]
fn test_corrupt_file_starts_empty_and_recovers() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let path = temp_dir.path().join("contacts.json");
    fs::write(&path, "{ not json").unwrap();

    let cache = ContactCache::open(&path);
    assert!(cache.is_empty());

    cache.upsert(upsert(Some("Fresh"), &["+15550005555"], &[])).unwrap();
    let raw = fs::read_to_string(&path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).expect("file rewritten as valid JSON");
    assert_eq!(parsed.as_array().map(Vec::len), Some(1));
}

#[cfg(unix)]
#[test]
fn test_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = tempdir().expect("Failed to create temp directory");
    let dir = temp_dir.path().join("private");
    let path = dir.join("contacts.json");

    let cache = ContactCache::open(&path);
    cache.upsert(upsert(Some("Secret"), &["+15550006666"], &[])).unwrap();

    let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    let dir_mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
    assert_eq!(file_mode, 0o600);
    assert_eq!(dir_mode, 0o700);
}

#[test]
fn test_search_matches_each_contact_once() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let cache = ContactCache::open(temp_dir.path().join("contacts.json"));

    // Matches on name and email, listed once
    cache.upsert(upsert(Some("Sam Example"), &[], &["sam@example.com"])).unwrap();
    cache.upsert(upsert(Some("Other"), &["+15550007777"], &[])).unwrap();

    let results = cache.search("example", 10);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name.as_deref(), Some("Sam Example"));

    assert_eq!(cache.search("555000", 10).len(), 1);
    assert_eq!(cache.search("", 1).len(), 1);
}

#[test]
fn test_delete_and_clear() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let path = temp_dir.path().join("contacts.json");
    let cache = ContactCache::open(&path);

    let a = cache.upsert(upsert(Some("A"), &["+15550008888"], &[])).unwrap();
    cache.upsert(upsert(Some("B"), &["+15550009999"], &[])).unwrap();

    assert!(cache.delete(&a.id).unwrap());
    assert!(!cache.delete(&a.id).unwrap());
    assert_eq!(cache.resolve(Some("+15550008888"), None, None), ContactResolution::NotFound);
    assert_eq!(ContactCache::open(&path).len(), 1);

    cache.clear().unwrap();
    assert!(cache.list_all().is_empty());
    assert!(ContactCache::open(&path).is_empty());
}

#[test]
fn test_results_follow_insertion_order() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let path = temp_dir.path().join("contacts.json");
    let cache = ContactCache::open(&path);

    for (name, phone) in [("Zed Parker", "+15550100001"), ("Amy Parker", "+15550100002"), ("Max Parker", "+15550100003")] {
        cache.upsert(upsert(Some(name), &[phone], &[])).unwrap();
    }
    // merging keeps the original position
    cache.upsert(upsert(Some("Zed Parker"), &["+15550100001"], &["zed@example.com"])).unwrap();

    let names = |contacts: Vec<imsg_gateway::models::Contact>| -> Vec<String> {
        contacts.into_iter().filter_map(|c| c.name).collect()
    };

    assert_eq!(names(cache.list_all()), vec!["Zed Parker", "Amy Parker", "Max Parker"]);
    assert_eq!(names(cache.search("parker", 2)), vec!["Zed Parker", "Amy Parker"]);

    match cache.resolve(None, None, Some("parker")) {
        ContactResolution::Ambiguous { candidates } => {
            assert_eq!(names(candidates), vec!["Zed Parker", "Amy Parker", "Max Parker"]);
        },
        other => panic!("expected ambiguous, got {other:?}"),
    }

    let reopened = ContactCache::open(&path);
    assert_eq!(names(reopened.list_all()), vec!["Zed Parker", "Amy Parker", "Max Parker"]);
}
