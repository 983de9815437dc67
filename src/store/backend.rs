// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The pluggable per-layer database interface and the shipped file backend.
//!
//! A backend stores `(group, name) -> record` with no knowledge of layers,
//! privileges semantics or the group invariant; all of that lives in the
//! façade. The file backend loads the whole database on open and rewrites
//! it atomically (temp file + rename) on every mutation, which is plenty for
//! a configuration store measured in kilobytes.

use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    store::StoreError,
    wire::record::{Record, decode_record, encode_record},
};

/// Identity of an entry inside one database: the group, and the key name
/// for non-group rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub group: String,
    pub name: Option<String>,
}

impl EntryKey {
    pub fn group_row(group: &str) -> Self {
        Self { group: group.to_owned(), name: None }
    }

    pub fn named(group: &str, name: &str) -> Self {
        Self { group: group.to_owned(), name: Some(name.to_owned()) }
    }
}

/// Uniform operations over one physical database.
pub trait Backend: Send {
    fn get(&self, key: &EntryKey) -> Option<&Record>;
    fn set(&mut self, key: EntryKey, record: Record) -> Result<(), StoreError>;
    /// Returns whether the key was present.
    fn unset(&mut self, key: &EntryKey) -> Result<bool, StoreError>;
    fn list_keys(&self) -> Vec<EntryKey>;
}

/// Magic at the start of every database file.
const DB_MAGIC: &[u8; 8] = b"BUXTONDB";

/// File-backed database: in-memory map, rewritten to disk on mutation.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    entries: HashMap<EntryKey, Record>,
}

impl FileBackend {
    /// Open an existing database, or start empty when the file is absent.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut backend = Self { path: path.to_owned(), entries: HashMap::new() };
        match fs::read(path) {
            Ok(bytes) => backend.load(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
        Ok(backend)
    }

    /// Create the physical database file if it does not exist yet.
    pub fn create_db(path: &Path) -> Result<(), StoreError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let empty = Self { path: path.to_owned(), entries: HashMap::new() };
        empty.flush()
    }

    fn load(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut buf = bytes;
        if buf.len() < DB_MAGIC.len() || buf[..DB_MAGIC.len()] != DB_MAGIC[..] {
            return Err(StoreError::BadRecord(
                crate::wire::error::WireError::MalformedFrame("bad database magic"),
            ));
        }
        buf.advance(DB_MAGIC.len());

        while buf.has_remaining() {
            let key = Self::read_chunk(&mut buf)?;
            let rec = Self::read_chunk(&mut buf)?;
            let key = Self::decode_key(&key)?;
            let record = decode_record(&rec)?;
            self.entries.insert(key, record);
        }
        Ok(())
    }

    fn read_chunk<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], StoreError> {
        if buf.remaining() < 4 {
            return Err(StoreError::BadRecord(
                crate::wire::error::WireError::MalformedFrame("truncated database"),
            ));
        }
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(StoreError::BadRecord(
                crate::wire::error::WireError::MalformedFrame("truncated database"),
            ));
        }
        let rest: &'a [u8] = *buf;
        let (chunk, tail) = rest.split_at(len);
        *buf = tail;
        Ok(chunk)
    }

    fn encode_key(key: &EntryKey, buf: &mut BytesMut) {
        buf.put_u32_le(key.group.len() as u32);
        buf.put_slice(key.group.as_bytes());
        match &key.name {
            Some(name) => {
                buf.put_u32_le(name.len() as u32);
                buf.put_slice(name.as_bytes());
            },
            None => buf.put_u32_le(0),
        }
    }

    fn decode_key(mut bytes: &[u8]) -> Result<EntryKey, StoreError> {
        let bad = || {
            StoreError::BadRecord(crate::wire::error::WireError::MalformedFrame(
                "bad database key",
            ))
        };
        let group = Self::read_chunk(&mut bytes).map_err(|_| bad())?;
        let name = Self::read_chunk(&mut bytes).map_err(|_| bad())?;
        if !bytes.is_empty() {
            return Err(bad());
        }
        let group = std::str::from_utf8(group).map_err(|_| bad())?.to_owned();
        let name = if name.is_empty() {
            None
        } else {
            Some(std::str::from_utf8(name).map_err(|_| bad())?.to_owned())
        };
        Ok(EntryKey { group, name })
    }

    fn flush(&self) -> Result<(), StoreError> {
        let mut buf = BytesMut::new();
        buf.put_slice(DB_MAGIC);

        // Stable order keeps rewrites deterministic.
        let mut keys: Vec<&EntryKey> = self.entries.keys().collect();
        keys.sort();
        for key in keys {
            let record = &self.entries[key];
            let mut key_buf = BytesMut::new();
            Self::encode_key(key, &mut key_buf);
            buf.put_u32_le(key_buf.len() as u32);
            buf.put_slice(&key_buf);

            let rec = encode_record(record);
            buf.put_u32_le(rec.len() as u32);
            buf.put_slice(&rec);
        }

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("db.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Backend for FileBackend {
    fn get(&self, key: &EntryKey) -> Option<&Record> {
        self.entries.get(key)
    }

    fn set(&mut self, key: EntryKey, record: Record) -> Result<(), StoreError> {
        self.entries.insert(key, record);
        self.flush()
    }

    fn unset(&mut self, key: &EntryKey) -> Result<bool, StoreError> {
        if self.entries.remove(key).is_none() {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    fn list_keys(&self) -> Vec<EntryKey> {
        let mut keys: Vec<EntryKey> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Purely in-memory backend for unit tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: HashMap<EntryKey, Record>,
}

impl Backend for MemoryBackend {
    fn get(&self, key: &EntryKey) -> Option<&Record> {
        self.entries.get(key)
    }

    fn set(&mut self, key: EntryKey, record: Record) -> Result<(), StoreError> {
        self.entries.insert(key, record);
        Ok(())
    }

    fn unset(&mut self, key: &EntryKey) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn list_keys(&self) -> Vec<EntryKey> {
        let mut keys: Vec<EntryKey> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}
