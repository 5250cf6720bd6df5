mod common;

use arbor::blink::{HintPageInformation, NavigationMode, NavigationStatus};
use arbor::{blob, BlinkIndex, DeweyId, Field, LatchMode, PageId, Store, StoreError, Tx};
use common::{int_index, open_store};
use tempfile::tempdir;

fn id(s: &str) -> DeweyId {
    s.parse().unwrap()
}

fn node_index(store: &Store, tx: &Tx, labels: &[&str]) -> BlinkIndex {
    let index = store
        .create_index(tx, "nodes", Field::DeweyId, Field::Bytes, true)
        .unwrap();
    for label in labels {
        index.insert(tx, &id(label).to_bytes(), label.as_bytes()).unwrap();
    }
    index
}

fn labels(children: impl Iterator<Item = arbor::Result<(DeweyId, Vec<u8>)>>) -> Vec<String> {
    children.map(|child| child.unwrap().0.to_string()).collect()
}

const DOCUMENT: &[&str] = &["1", "1.2", "1.2.2", "1.2.3", "1.3", "1.3.1", "1.3.1.2", "1.3.2", "1.5", "2", "2.2"];

#[test]
fn test_children_in_document_order() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let tx = store.begin();
    let index = node_index(&store, &tx, DOCUMENT);

    assert_eq!(labels(index.children(&tx, id("1"))), ["1.2", "1.3", "1.5"]);
    assert_eq!(labels(index.children(&tx, id("1.2"))), ["1.2.2", "1.2.3"]);
    // The attribute root is not a child.
    assert_eq!(labels(index.children(&tx, id("1.3"))), ["1.3.2"]);
    assert!(labels(index.children(&tx, id("1.2.2"))).is_empty());
    assert_eq!(labels(index.children(&tx, id("2"))), ["2.2"]);
    store.commit(&tx).unwrap();
}

#[test]
fn test_navigation_modes() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let tx = store.begin();
    let index = node_index(&store, &tx, DOCUMENT);

    let found = index.navigate(&tx, NavigationMode::ToKey, &id("1.3"), None).unwrap();
    assert!(found.is_found());
    assert_eq!(found.key, Some(id("1.3")));
    assert_eq!(found.value.as_deref(), Some(&b"1.3"[..]));
    assert!(found.hint.is_some());

    let missing = index.navigate(&tx, NavigationMode::ToKey, &id("1.4"), None).unwrap();
    assert_eq!(missing.status, NavigationStatus::NotExistent);

    let first = index.navigate(&tx, NavigationMode::FirstChild, &id("1.2"), None).unwrap();
    assert_eq!(first.key, Some(id("1.2.2")));
    let next = index.navigate(&tx, NavigationMode::NextSibling, &id("1.2.3"), None).unwrap();
    assert_eq!(next.status, NavigationStatus::NotExistent);
    let next = index.navigate(&tx, NavigationMode::NextSibling, &id("1.3"), None).unwrap();
    assert_eq!(next.key, Some(id("1.5")));
    let last = index.navigate(&tx, NavigationMode::NextSibling, &id("1.5"), None).unwrap();
    assert_eq!(last.status, NavigationStatus::NotExistent);

    // A document has no siblings.
    let document = index.navigate(&tx, NavigationMode::NextSibling, &id("1"), None).unwrap();
    assert_eq!(document.status, NavigationStatus::NotExistent);
    store.commit(&tx).unwrap();
}

#[test]
fn test_hint_answers_locally_until_the_page_changes() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let tx = store.begin();
    let index = node_index(&store, &tx, DOCUMENT);

    let hint = index
        .navigate(&tx, NavigationMode::ToKey, &id("1.3"), None)
        .unwrap()
        .hint
        .unwrap();
    let local = index
        .navigate_local(&tx, NavigationMode::NextSibling, &id("1.3"), hint)
        .unwrap();
    assert_eq!(local.status, NavigationStatus::Found);
    assert_eq!(local.key, Some(id("1.5")));
    assert_eq!(local.hint, Some(hint));

    index.insert(&tx, &id("1.4").to_bytes(), b"1.4").unwrap();
    let stale = index
        .navigate_local(&tx, NavigationMode::NextSibling, &id("1.3"), hint)
        .unwrap();
    assert_eq!(stale.status, NavigationStatus::NeedsTreeAccess);

    let fallback = index
        .navigate(&tx, NavigationMode::NextSibling, &id("1.3"), Some(hint))
        .unwrap();
    assert_eq!(fallback.key, Some(id("1.4")));
    assert_ne!(fallback.hint, Some(hint));
    store.commit(&tx).unwrap();
}

#[test]
fn test_hint_to_a_foreign_page_needs_tree_access() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let tx = store.begin();
    let index = node_index(&store, &tx, DOCUMENT);
    let other = store
        .create_index(&tx, "other", Field::DeweyId, Field::Bytes, true)
        .unwrap();
    for label in ["1", "1.3", "1.7"] {
        other.insert(&tx, &id(label).to_bytes(), b"other").unwrap();
    }
    let blob_page = blob::store(&tx, 0, 99, b"payload").unwrap();
    let blob_lsn = store
        .buffer_manager()
        .fix(blob_page, LatchMode::Shared)
        .unwrap()
        .lsn()
        .unwrap();

    let foreign = [
        other.navigate(&tx, NavigationMode::ToKey, &id("1.3"), None).unwrap().hint.unwrap(),
        HintPageInformation { page_id: blob_page, lsn: blob_lsn },
        HintPageInformation { page_id: PageId::new(0, 4000), lsn: 0 },
    ];
    for hint in foreign {
        let local = index
            .navigate_local(&tx, NavigationMode::NextSibling, &id("1.3"), hint)
            .unwrap();
        assert_eq!(local.status, NavigationStatus::NeedsTreeAccess, "{hint:?}");
        let found = index
            .navigate(&tx, NavigationMode::NextSibling, &id("1.3"), Some(hint))
            .unwrap();
        assert_eq!(found.key, Some(id("1.5")));
    }
    store.commit(&tx).unwrap();
}

#[test]
fn test_children_across_many_leaves() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let tx = store.begin();
    let index = store
        .create_index(&tx, "nodes", Field::DeweyId, Field::Bytes, true)
        .unwrap();
    let root = id("7");
    index.insert(&tx, &root.to_bytes(), b"root").unwrap();
    for division in (2..4002).step_by(2) {
        let child = root.child(division);
        index.insert(&tx, &child.to_bytes(), &[0u8; 24]).unwrap();
        // A grandchild between every pair of children.
        index.insert(&tx, &child.child(2).to_bytes(), b"leaf").unwrap();
    }
    assert!(index.verify(&tx).unwrap().height >= 1);

    let children: Vec<DeweyId> = index.children(&tx, root.clone()).map(|c| c.unwrap().0).collect();
    assert_eq!(children.len(), 2000);
    assert!(children.iter().all(|c| c.is_child_of(&root)));
    assert!(children.windows(2).all(|w| w[0] < w[1]));
    store.commit(&tx).unwrap();
}

#[test]
fn test_navigation_needs_dewey_keys() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let tx = store.begin();
    let index = int_index(&store, &tx, true);
    let err = index.navigate(&tx, NavigationMode::ToKey, &id("1"), None).unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));
    store.commit(&tx).unwrap();
}
