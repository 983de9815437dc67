// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::PathBuf;

use anyhow::Result;
use buxton::{
    cfg::enums::LayerKind,
    store::{
        StoreError,
        backend::{FileBackend, MemoryBackend},
        engine::{GROUP_SENTINEL, Store},
        layer::Layer,
    },
    wire::value::{DataType, Value},
};

fn layer(name: &str, kind: LayerKind, priority: i32, readonly: bool) -> Layer {
    Layer {
        name: name.into(),
        kind,
        priority,
        readonly,
        db_path: PathBuf::new(),
        description: None,
    }
}

/// base(system,1), over(system,5), u(user,10), frozen(system,1,ro).
fn test_store() -> Store {
    let layers = vec![
        layer("base", LayerKind::System, 1, false),
        layer("over", LayerKind::System, 5, false),
        layer("u", LayerKind::User, 10, false),
        layer("frozen", LayerKind::System, 1, true),
    ];
    Store::with_backends(layers, |_| Box::new(MemoryBackend::default()))
}

#[test]
fn set_without_group_fails() {
    let mut store = test_store();
    let err = store.set_value("base", "G", "k", Value::Int32(1));
    assert!(matches!(err, Err(StoreError::NoSuchGroup { .. })));
}

#[test]
fn group_row_carries_sentinel() -> Result<()> {
    let mut store = test_store();
    store.create_group("base", "G", None)?;
    let record = store.get_in_layer("base", "G", None, None)?;
    assert_eq!(record.value, Value::String(GROUP_SENTINEL.into()));
    assert_eq!(record.read_priv, "");
    Ok(())
}

#[test]
fn create_group_twice_fails() -> Result<()> {
    let mut store = test_store();
    store.create_group("base", "G", None)?;
    assert!(matches!(
        store.create_group("base", "G", None),
        Err(StoreError::GroupExists { .. })
    ));
    Ok(())
}

#[test]
fn remove_absent_group_fails() {
    let mut store = test_store();
    assert!(matches!(
        store.remove_group("base", "G"),
        Err(StoreError::NoSuchGroup { .. })
    ));
}

#[test]
fn key_behind_removed_group_is_invisible() -> Result<()> {
    let mut store = test_store();
    store.create_group("base", "G", None)?;
    store.set_value("base", "G", "k", Value::Int32(1))?;
    store.remove_group("base", "G")?;
    assert!(matches!(
        store.get_in_layer("base", "G", Some("k"), None),
        Err(StoreError::NoSuchGroup { .. })
    ));
    Ok(())
}

#[test]
fn readonly_layer_rejects_mutation() {
    let mut store = test_store();
    assert!(matches!(
        store.create_group("frozen", "G", None),
        Err(StoreError::ReadOnlyLayer(_))
    ));
    assert!(matches!(
        store.set_value("frozen", "G", "k", Value::Int32(1)),
        Err(StoreError::ReadOnlyLayer(_))
    ));
}

#[test]
fn unknown_layer_fails() {
    let store = test_store();
    assert!(matches!(
        store.get_in_layer("nope", "G", None, None),
        Err(StoreError::NoSuchLayer(_))
    ));
}

#[test]
fn higher_priority_system_layer_wins() -> Result<()> {
    let mut store = test_store();
    store.create_group("base", "G", None)?;
    store.create_group("over", "G", None)?;
    store.set_value("base", "G", "k", Value::String("old".into()))?;
    store.set_value("over", "G", "k", Value::String("new".into()))?;

    let (record, from) = store.get_effective("G", Some("k"), None)?;
    assert_eq!(record.value, Value::String("new".into()));
    assert_eq!(from, "over");
    Ok(())
}

#[test]
fn system_beats_user_regardless_of_priority() -> Result<()> {
    let mut store = test_store();
    store.create_group("u", "G", None)?;
    store.set_value("u", "G", "k", Value::Int32(10))?;

    // Only the user layer is populated: its value resolves.
    let (record, from) = store.get_effective("G", Some("k"), None)?;
    assert_eq!(record.value, Value::Int32(10));
    assert_eq!(from, "u");

    // A system hit appears: it wins despite the lower priority.
    store.create_group("base", "G", None)?;
    store.set_value("base", "G", "k", Value::Int32(1))?;
    let (record, from) = store.get_effective("G", Some("k"), None)?;
    assert_eq!(record.value, Value::Int32(1));
    assert_eq!(from, "base");
    Ok(())
}

#[test]
fn miss_everywhere_is_not_found() {
    let store = test_store();
    assert!(matches!(
        store.get_effective("G", Some("k"), None),
        Err(StoreError::NotFound)
    ));
}

#[test]
fn type_filter_hides_mismatched_entries() -> Result<()> {
    let mut store = test_store();
    store.create_group("base", "G", None)?;
    store.set_value("base", "G", "k", Value::Int32(1))?;

    assert!(store.get_in_layer("base", "G", Some("k"), Some(DataType::Int32)).is_ok());
    assert!(matches!(
        store.get_in_layer("base", "G", Some("k"), Some(DataType::String)),
        Err(StoreError::NotFound)
    ));
    // Unset matches anything.
    assert!(store.get_in_layer("base", "G", Some("k"), Some(DataType::Unset)).is_ok());
    Ok(())
}

#[test]
fn set_preserves_privileges() -> Result<()> {
    let mut store = test_store();
    store.create_group("base", "G", None)?;
    store.set_value("base", "G", "k", Value::Int32(1))?;
    store.set_label("base", "G", Some("k"), "privilege.k", 0)?;
    store.set_value("base", "G", "k", Value::Int32(2))?;

    let record = store.get_in_layer("base", "G", Some("k"), None)?;
    assert_eq!(record.value, Value::Int32(2));
    assert_eq!(record.read_priv, "privilege.k");
    assert_eq!(record.write_priv, "privilege.k");
    Ok(())
}

#[test]
fn set_label_requires_root_on_system_layers() -> Result<()> {
    let mut store = test_store();
    store.create_group("base", "G", None)?;
    assert!(matches!(
        store.set_label("base", "G", None, "P", 1000),
        Err(StoreError::PermissionDenied)
    ));
    store.set_label("base", "G", None, "P", 0)?;
    assert_eq!(store.get_in_layer("base", "G", None, None)?.read_priv, "P");
    Ok(())
}

#[test]
fn set_label_rejected_on_user_layers() -> Result<()> {
    let mut store = test_store();
    store.create_group("u", "G", None)?;
    assert!(matches!(
        store.set_label("u", "G", None, "P", 0),
        Err(StoreError::PermissionDenied)
    ));
    Ok(())
}

#[test]
fn unset_absent_key_fails() -> Result<()> {
    let mut store = test_store();
    store.create_group("base", "G", None)?;
    assert!(matches!(
        store.unset_value("base", "G", "k", None),
        Err(StoreError::NotFound)
    ));
    Ok(())
}

#[test]
fn unset_then_get_fails() -> Result<()> {
    let mut store = test_store();
    store.create_group("base", "G", None)?;
    store.set_value("base", "G", "k", Value::Boolean(true))?;
    store.unset_value("base", "G", "k", None)?;
    assert!(matches!(
        store.get_in_layer("base", "G", Some("k"), None),
        Err(StoreError::NotFound)
    ));
    Ok(())
}

#[test]
fn list_names_scopes_and_sorts() -> Result<()> {
    let mut store = test_store();
    store.create_group("base", "Audio", None)?;
    store.create_group("base", "Video", None)?;
    store.set_value("base", "Audio", "volume", Value::Int32(3))?;
    store.set_value("base", "Audio", "balance", Value::Int32(0))?;
    store.set_value("base", "Video", "brightness", Value::Int32(7))?;

    assert_eq!(store.list_names("base", None, None)?, vec!["Audio", "Video"]);
    assert_eq!(
        store.list_names("base", Some("Audio"), None)?,
        vec!["balance", "volume"]
    );
    assert_eq!(
        store.list_names("base", Some("Audio"), Some("vol"))?,
        vec!["volume"]
    );
    assert!(store.list_names("base", Some("Missing"), None)?.is_empty());
    Ok(())
}

#[test]
fn file_backend_persists_across_reopen() -> Result<()> {
    let dir = std::env::temp_dir().join(format!(
        "buxton-unit-{}-{}",
        std::process::id(),
        rand::random::<u32>()
    ));
    std::fs::create_dir_all(&dir)?;
    let db_path = dir.join("persist.db");

    {
        let mut backend = FileBackend::open(&db_path)?;
        use buxton::{store::backend::{Backend, EntryKey}, wire::record::Record};
        backend.set(
            EntryKey::group_row("G"),
            Record::new(Value::String(GROUP_SENTINEL.into()), "".into(), "".into()),
        )?;
        backend.set(
            EntryKey::named("G", "k"),
            Record::new(Value::UInt64(77), "rp".into(), "wp".into()),
        )?;
    }

    {
        use buxton::store::backend::{Backend, EntryKey};
        let backend = FileBackend::open(&db_path)?;
        let record = backend.get(&EntryKey::named("G", "k")).expect("persisted");
        assert_eq!(record.value, Value::UInt64(77));
        assert_eq!(record.read_priv, "rp");
        assert_eq!(record.write_priv, "wp");
        assert_eq!(backend.list_keys().len(), 2);
    }

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
