// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Preference and setting stores.
//!
//! The controller never talks to a concrete store. It gets a [`FlagStore`] for
//! boolean preferences (such as whether DC dimming is on) and a
//! [`SettingStore`] for integer system settings (screen brightness). The
//! switch needs a little more, namely integers and small records that survive
//! a reboot, and asks for a [`PrefStore`]. Every call goes back to the
//! backing store; nothing is cached.
//!
//! [`PrefsFile`] implements all three on top of a JSON object in a file.

use crate::error::SettingError;
use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Persistent boolean preferences.
pub trait FlagStore {
    /// Reads `key`. Missing or unreadable keys read as `false`.
    fn get_flag(&self, key: &str) -> bool;

    /// Stores `value` under `key`.
    fn set_flag(&self, key: &str, value: bool) -> io::Result<()>;
}

/// Persistent preferences of any JSON-representable type.
pub trait PrefStore: FlagStore {
    /// Raw value stored under `key`.
    fn get_value(&self, key: &str) -> Option<Value>;

    /// Stores `value` under `key`.
    fn set_value(&self, key: &str, value: Value) -> io::Result<()>;

    /// Removes every key in `keys`. Missing keys are fine.
    fn remove(&self, keys: &[&str]) -> io::Result<()>;

    /// Reads `key` as an integer. Numbers written as strings are accepted,
    /// since hand-edited files tend to have them.
    fn get_int(&self, key: &str) -> Option<i32> {
        match self.get_value(key)? {
            Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Stores an integer under `key`.
    fn set_int(&self, key: &str, value: i32) -> io::Result<()> {
        self.set_value(key, Value::from(value))
    }

    /// Reads and deserializes `key`. Values of the wrong shape read as `None`.
    fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        serde_json::from_value(self.get_value(key)?).ok()
    }

    /// Serializes `value` into `key`.
    fn set<T: Serialize>(&self, key: &str, value: &T) -> io::Result<()> {
        let value = serde_json::to_value(value).map_err(io::Error::other)?;
        self.set_value(key, value)
    }
}

/// Integer system settings.
pub trait SettingStore {
    /// Current value of `key`, if the backend has one.
    fn read_int(&self, key: &str) -> Option<i32>;

    /// Sets `key` to `value`.
    fn put_int(&self, key: &str, value: i32) -> Result<(), SettingError>;
}

impl<T: FlagStore + ?Sized> FlagStore for &T {
    fn get_flag(&self, key: &str) -> bool {
        (**self).get_flag(key)
    }

    fn set_flag(&self, key: &str, value: bool) -> io::Result<()> {
        (**self).set_flag(key, value)
    }
}

impl<T: PrefStore + ?Sized> PrefStore for &T {
    fn get_value(&self, key: &str) -> Option<Value> {
        (**self).get_value(key)
    }

    fn set_value(&self, key: &str, value: Value) -> io::Result<()> {
        (**self).set_value(key, value)
    }

    fn remove(&self, keys: &[&str]) -> io::Result<()> {
        (**self).remove(keys)
    }
}

impl<T: SettingStore + ?Sized> SettingStore for &T {
    fn read_int(&self, key: &str) -> Option<i32> {
        (**self).read_int(key)
    }

    fn put_int(&self, key: &str, value: i32) -> Result<(), SettingError> {
        (**self).put_int(key, value)
    }
}

/// A store backed by a file holding one JSON object.
///
/// Every read parses the file again and every write rewrites it whole. A
/// missing file is an empty store; so is one that doesn't parse, with a
/// warning, so a corrupted file can't wedge the switch.
#[derive(Clone, Debug)]
pub struct PrefsFile {
    path: PathBuf,
}

impl PrefsFile {
    /// Uses the file at `path`, which need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Map<String, Value> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!("could not read {}: {e}", self.path.display());
                }
                return Map::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                warn!("ignoring unparseable {}: {e}", self.path.display());
                Map::new()
            }
        }
    }

    fn update(&self, f: impl FnOnce(&mut Map<String, Value>)) -> io::Result<()> {
        let mut map = self.load();
        f(&mut map);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&map).map_err(io::Error::other)?;
        fs::write(&self.path, json)
    }
}

impl FlagStore for PrefsFile {
    fn get_flag(&self, key: &str) -> bool {
        match self.get_value(key) {
            Some(Value::Bool(b)) => b,
            Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "1"),
            _ => false,
        }
    }

    fn set_flag(&self, key: &str, value: bool) -> io::Result<()> {
        self.set_value(key, Value::Bool(value))
    }
}

impl PrefStore for PrefsFile {
    fn get_value(&self, key: &str) -> Option<Value> {
        self.load().remove(key)
    }

    fn set_value(&self, key: &str, value: Value) -> io::Result<()> {
        self.update(|map| {
            map.insert(key.to_owned(), value);
        })
    }

    fn remove(&self, keys: &[&str]) -> io::Result<()> {
        self.update(|map| {
            for key in keys {
                map.remove(*key);
            }
        })
    }
}

impl SettingStore for PrefsFile {
    fn read_int(&self, key: &str) -> Option<i32> {
        self.get_int(key)
    }

    fn put_int(&self, key: &str, value: i32) -> Result<(), SettingError> {
        self.set_int(key, value)
            .map_err(|e| SettingError::from_io(key, e))
    }
}
