// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The storage façade: one open database per layer, the layered read
//! resolution rules, and every invariant the backends are not trusted with
//! (group existence, read-only layers, label permission policy).

use std::collections::HashMap;

use tracing::debug;

use crate::{
    cfg::{config::Config, enums::LayerKind},
    store::{
        StoreError,
        backend::{Backend, EntryKey, FileBackend},
        layer::Layer,
    },
    wire::{record::Record, value::{DataType, Value}},
};

/// Groups have no value of their own; their row stores this sentinel.
pub const GROUP_SENTINEL: &str = "BUXTON_GROUP_VALUE";

/// Environment variable that, when set to `0`, lifts the uid-0 requirement
/// for privilege changes on system layers. Test and bootstrap use only.
pub const ROOT_CHECK_ENV: &str = "BUXTON_ROOT_CHECK";

/// The layered store. Sole owner of the backend databases; all access goes
/// through the invariant-enforcing methods below.
pub struct Store {
    layers: Vec<Layer>,
    dbs: HashMap<String, Box<dyn Backend>>,
}

impl Store {
    /// Open one file backend per configured layer.
    pub fn open(cfg: &Config) -> Result<Self, StoreError> {
        let layers: Vec<Layer> = cfg
            .layers
            .iter()
            .map(|l| Layer::from_config(l, &cfg.daemon.db_dir))
            .collect();
        let mut dbs: HashMap<String, Box<dyn Backend>> = HashMap::new();
        for layer in &layers {
            let backend = FileBackend::open(&layer.db_path)?;
            dbs.insert(layer.name.clone(), Box::new(backend));
        }
        Ok(Self { layers, dbs })
    }

    /// Assemble a store over caller-provided backends. Used by tests that
    /// want memory-only databases.
    pub fn with_backends(
        layers: Vec<Layer>,
        mut make: impl FnMut(&Layer) -> Box<dyn Backend>,
    ) -> Self {
        let dbs = layers.iter().map(|l| (l.name.clone(), make(l))).collect();
        Self { layers, dbs }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Result<&Layer, StoreError> {
        self.layers
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| StoreError::NoSuchLayer(name.to_owned()))
    }

    fn db(&self, layer: &str) -> Result<&dyn Backend, StoreError> {
        self.dbs
            .get(layer)
            .map(|b| b.as_ref())
            .ok_or_else(|| StoreError::NoSuchLayer(layer.to_owned()))
    }

    fn db_mut(&mut self, layer: &str) -> Result<&mut Box<dyn Backend>, StoreError> {
        self.dbs
            .get_mut(layer)
            .ok_or_else(|| StoreError::NoSuchLayer(layer.to_owned()))
    }

    fn check_writable(&self, layer: &str) -> Result<(), StoreError> {
        if self.layer(layer)?.readonly {
            return Err(StoreError::ReadOnlyLayer(layer.to_owned()));
        }
        Ok(())
    }

    fn require_group(&self, layer: &str, group: &str) -> Result<(), StoreError> {
        if self.db(layer)?.get(&EntryKey::group_row(group)).is_none() {
            return Err(StoreError::NoSuchGroup {
                layer: layer.to_owned(),
                group: group.to_owned(),
            });
        }
        Ok(())
    }

    fn expect_type(record: &Record, expected: Option<DataType>) -> Result<(), StoreError> {
        match expected {
            Some(ty) if ty != DataType::Unset && record.value.data_type() != ty => {
                Err(StoreError::NotFound)
            },
            _ => Ok(()),
        }
    }

    /// Single-layer read. The group row must exist before a named key is
    /// visible, even if the key row itself is present.
    pub fn get_in_layer(
        &self,
        layer: &str,
        group: &str,
        name: Option<&str>,
        expected: Option<DataType>,
    ) -> Result<Record, StoreError> {
        self.layer(layer)?;
        if name.is_some() {
            self.require_group(layer, group)?;
        }
        let key = match name {
            Some(n) => EntryKey::named(group, n),
            None => EntryKey::group_row(group),
        };
        let record = self.db(layer)?.get(&key).ok_or(StoreError::NotFound)?;
        Self::expect_type(record, expected)?;
        Ok(record.clone())
    }

    /// Cross-layer read: consult every layer and pick the effective one.
    ///
    /// Any system hit beats every user hit; within a kind the greatest
    /// priority wins, with configuration order breaking ties (first wins).
    /// Returns the record together with the winning layer's name.
    pub fn get_effective(
        &self,
        group: &str,
        name: Option<&str>,
        expected: Option<DataType>,
    ) -> Result<(Record, String), StoreError> {
        let mut winner: Option<(&Layer, Record)> = None;

        for layer in &self.layers {
            let Ok(record) = self.get_in_layer(&layer.name, group, name, expected)
            else {
                continue;
            };
            let better = match &winner {
                None => true,
                Some((best, _)) => match (layer.kind, best.kind) {
                    (LayerKind::System, LayerKind::User) => true,
                    (LayerKind::User, LayerKind::System) => false,
                    _ => layer.priority > best.priority,
                },
            };
            if better {
                winner = Some((layer, record));
            }
        }

        winner
            .map(|(layer, record)| (record, layer.name.clone()))
            .ok_or(StoreError::NotFound)
    }

    /// Read dispatch: layer-scoped when a layer is named, effective
    /// resolution otherwise.
    pub fn get(
        &self,
        layer: Option<&str>,
        group: &str,
        name: Option<&str>,
        expected: Option<DataType>,
    ) -> Result<(Record, String), StoreError> {
        match layer {
            Some(l) => Ok((self.get_in_layer(l, group, name, expected)?, l.to_owned())),
            None => self.get_effective(group, name, expected),
        }
    }

    /// Persist a value. The layer must be writable and the group row must
    /// already exist; an existing entry keeps its privileges, a fresh one
    /// starts unrestricted.
    pub fn set_value(
        &mut self,
        layer: &str,
        group: &str,
        name: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        self.check_writable(layer)?;
        self.require_group(layer, group)?;

        let key = EntryKey::named(group, name);
        let (read_priv, write_priv) = match self.db(layer)?.get(&key) {
            Some(old) => (old.read_priv.clone(), old.write_priv.clone()),
            None => (String::new(), String::new()),
        };
        debug!(layer, group, name, "set value");
        self.db_mut(layer)?
            .set(key, Record::new(value, read_priv, write_priv))
    }

    /// Persist a privilege string on a group or key. System layers only,
    /// and only for uid 0 unless [`ROOT_CHECK_ENV`] is `0`.
    pub fn set_label(
        &mut self,
        layer: &str,
        group: &str,
        name: Option<&str>,
        label: &str,
        uid: u32,
    ) -> Result<(), StoreError> {
        self.check_writable(layer)?;

        if self.layer(layer)?.kind != LayerKind::System {
            debug!(layer, "cannot set privileges in a user layer");
            return Err(StoreError::PermissionDenied);
        }
        let skip_check =
            std::env::var(ROOT_CHECK_ENV).is_ok_and(|v| v == "0");
        if uid != 0 && !skip_check {
            debug!(uid, group, "privilege change requires uid 0");
            return Err(StoreError::PermissionDenied);
        }

        let key = match name {
            Some(n) => {
                self.require_group(layer, group)?;
                EntryKey::named(group, n)
            },
            None => EntryKey::group_row(group),
        };
        let old = self.db(layer)?.get(&key).cloned().ok_or_else(|| match name {
            Some(_) => StoreError::NotFound,
            None => StoreError::NoSuchGroup {
                layer: layer.to_owned(),
                group: group.to_owned(),
            },
        })?;
        debug!(layer, group, name, "set label");
        self.db_mut(layer)?
            .set(key, Record::new(old.value, label.to_owned(), label.to_owned()))
    }

    /// Create a group row with the supplied privilege on both directions,
    /// unrestricted if none given.
    pub fn create_group(
        &mut self,
        layer: &str,
        group: &str,
        privilege: Option<&str>,
    ) -> Result<(), StoreError> {
        self.check_writable(layer)?;

        let key = EntryKey::group_row(group);
        if self.db(layer)?.get(&key).is_some() {
            return Err(StoreError::GroupExists {
                layer: layer.to_owned(),
                group: group.to_owned(),
            });
        }
        let privilege = privilege.unwrap_or_default().to_owned();
        debug!(layer, group, "create group");
        self.db_mut(layer)?.set(
            key,
            Record::new(
                Value::String(GROUP_SENTINEL.to_owned()),
                privilege.clone(),
                privilege,
            ),
        )
    }

    /// Remove a group row. Keys under the group are untouched; they become
    /// unreachable until the group is recreated.
    pub fn remove_group(&mut self, layer: &str, group: &str) -> Result<(), StoreError> {
        self.check_writable(layer)?;
        self.require_group(layer, group)?;
        debug!(layer, group, "remove group");
        self.db_mut(layer)?.unset(&EntryKey::group_row(group))?;
        Ok(())
    }

    /// Remove a key. Fails with `NotFound` when the key is absent, with
    /// `NoSuchGroup` when the whole group is.
    pub fn unset_value(
        &mut self,
        layer: &str,
        group: &str,
        name: &str,
        expected: Option<DataType>,
    ) -> Result<(), StoreError> {
        self.check_writable(layer)?;
        self.require_group(layer, group)?;

        let key = EntryKey::named(group, name);
        match self.db(layer)?.get(&key) {
            Some(record) => Self::expect_type(record, expected)?,
            None => return Err(StoreError::NotFound),
        }
        debug!(layer, group, name, "unset value");
        self.db_mut(layer)?.unset(&key)?;
        Ok(())
    }

    /// Sorted names in a layer: key names within `group` when given, group
    /// names otherwise; optionally filtered by prefix.
    pub fn list_names(
        &self,
        layer: &str,
        group: Option<&str>,
        prefix: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let db = self.db(layer)?;
        let mut names: Vec<String> = db
            .list_keys()
            .into_iter()
            .filter_map(|key| match (group, key.name) {
                (Some(g), Some(name)) if key.group == g => Some(name),
                (None, None) => Some(key.group),
                _ => None,
            })
            .filter(|n| prefix.is_none_or(|p| n.starts_with(p)))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Every entry key in a layer. Off the wire surface; serves the direct
    /// CLI path only.
    pub fn list_keys(&self, layer: &str) -> Result<Vec<EntryKey>, StoreError> {
        Ok(self.db(layer)?.list_keys())
    }

    /// Create the physical database for a system layer; a no-op for user
    /// layers, whose databases appear on first write.
    pub fn create_db(&self, layer: &str) -> Result<(), StoreError> {
        let layer = self.layer(layer)?;
        if layer.kind == LayerKind::User {
            return Ok(());
        }
        FileBackend::create_db(&layer.db_path)
    }
}
