// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Screen brightness through systemd-logind.
//!
//! On a desktop Linux system there is no settings provider holding "the"
//! screen brightness. The closest equivalent is the backlight device itself,
//! which logind will set for us without root privileges as long as we are the
//! user logged in at the seat that owns the display. [`LogindBrightness`]
//! exposes that as a [`SettingStore`] so the controller can use it in place of
//! a settings file.

use crate::{error::SettingError, prefs::SettingStore};
use anyhow::{bail, Context};
use log::debug;
use logind_zbus::session::SessionProxyBlocking;
use std::{ffi::OsString, fmt, fs, path::Path};
use zbus::blocking::Connection;

const BACKLIGHT_CLASS: &str = "/sys/class/backlight";

/// DBus error name logind uses when the caller does not own the seat.
const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";

/// A backlight device found under `/sys/class/backlight`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backlight {
    /// Directory name under `/sys/class/backlight`, which is also the name
    /// logind wants.
    pub name: OsString,

    /// Highest raw value the backlight supports. Units vary by driver.
    pub max: u32,
}

/// Locates the first usable backlight device in `/sys/class/backlight`.
///
/// On success, returns both the `Backlight` and its current raw setting.
pub fn find_first_backlight() -> anyhow::Result<(Backlight, u32)> {
    find_first_backlight_in(Path::new(BACKLIGHT_CLASS))
}

/// Finds a backlight given a user-specified name.
///
/// On success, returns both the `Backlight` and its current setting.
pub fn use_specific_backlight(name: OsString) -> anyhow::Result<(Backlight, u32)> {
    use_specific_backlight_in(Path::new(BACKLIGHT_CLASS), name)
}

fn find_first_backlight_in(class: &Path) -> anyhow::Result<(Backlight, u32)> {
    let dir = fs::read_dir(class)
        .with_context(|| format!("can't access directory {}", class.display()))?;

    let mut entries = dir.collect::<Result<Vec<_>, _>>()?;
    // read_dir order is arbitrary; keep the choice stable across runs.
    entries.sort_by_key(|e| e.file_name());

    for dirent in entries {
        let path = dirent.path();
        match read_backlight_settings(&path) {
            Ok((current, max)) => {
                return Ok((
                    Backlight {
                        name: dirent.file_name(),
                        max,
                    },
                    current,
                ));
            }
            Err(e) => {
                debug!("skipping backlight-like device at {}: {e:#}", path.display());
            }
        }
    }

    bail!("cannot find any valid backlight devices in {}", class.display())
}

fn use_specific_backlight_in(class: &Path, name: OsString) -> anyhow::Result<(Backlight, u32)> {
    let path = class.join(&name);
    let (current, max) = read_backlight_settings(&path)
        .with_context(|| format!("can't use explicitly requested backlight device {name:?}"))?;

    Ok((Backlight { name, max }, current))
}

/// Loads settings for a single backlight device given its fully-qualified
/// directory path. Returns: `(current_value, max_value)`.
fn read_backlight_settings(path: &Path) -> anyhow::Result<(u32, u32)> {
    let mut parsed = vec![];
    for component in ["brightness", "max_brightness"] {
        let c_path = path.join(component);
        let contents = fs::read_to_string(&c_path)
            .with_context(|| format!("reading backlight file {}", c_path.display()))?;
        let number = contents.trim().parse::<u32>().with_context(|| {
            format!(
                "parsing brightness value from file {}: {contents}",
                c_path.display()
            )
        })?;
        parsed.push(number);
    }
    if parsed[1] == 0 {
        bail!("backlight at {} reports max_brightness 0", path.display());
    }
    Ok((parsed[0], parsed[1]))
}

/// Maps a 0..=255 screen brightness setting onto a device's raw range.
fn scale_to_device(value: i32, max: u32) -> u32 {
    let value = value.clamp(0, crate::SCREEN_BRIGHTNESS_MAX) as u64;
    (value * u64::from(max) / crate::SCREEN_BRIGHTNESS_MAX as u64) as u32
}

/// Maps a device's raw level back onto the 0..=255 setting range.
fn scale_from_device(raw: u32, max: u32) -> i32 {
    let raw = u64::from(raw.min(max));
    (raw * crate::SCREEN_BRIGHTNESS_MAX as u64 / u64::from(max.max(1))) as i32
}

/// Reads the current level of `backlight` under `class` as a setting value.
fn read_setting(class: &Path, backlight: &Backlight) -> Option<i32> {
    match read_backlight_settings(&class.join(&backlight.name)) {
        Ok((current, max)) => Some(scale_from_device(current, max)),
        Err(e) => {
            debug!("can't read backlight {:?}: {e:#}", backlight.name);
            None
        }
    }
}

/// [`SettingStore`] that applies `screen_brightness` to a backlight through
/// logind.
///
/// A backlight has no automatic mode, so `screen_brightness_mode` always reads
/// as manual and only accepts manual. Other keys are unsupported.
pub struct LogindBrightness {
    session: SessionProxyBlocking<'static>,
    backlight: Backlight,
    name: String,
}

impl fmt::Debug for LogindBrightness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogindBrightness")
            .field("backlight", &self.backlight)
            .finish_non_exhaustive()
    }
}

impl LogindBrightness {
    /// Connects to the current session on the system bus for `backlight`.
    pub fn connect(backlight: Backlight) -> anyhow::Result<Self> {
        let Some(name) = backlight.name.to_str().map(str::to_owned) else {
            // Kernel device names are ASCII, so this shouldn't happen.
            bail!("backlight name not valid UTF-8?! name: {:?}", backlight.name);
        };

        // The session object lives on the SYSTEM bus, not the session bus.
        let conn = Connection::system().context("can't connect to the system bus")?;
        let session = SessionProxyBlocking::builder(&conn)
            .path("/org/freedesktop/login1/session/auto")?
            .build()
            .context("can't reach the logind session")?;

        Ok(Self {
            session,
            backlight,
            name,
        })
    }

    /// The backlight being driven.
    pub fn backlight(&self) -> &Backlight {
        &self.backlight
    }
}

impl SettingStore for LogindBrightness {
    fn read_int(&self, key: &str) -> Option<i32> {
        match key {
            crate::SCREEN_BRIGHTNESS_KEY => {
                read_setting(Path::new(BACKLIGHT_CLASS), &self.backlight)
            }
            crate::SCREEN_BRIGHTNESS_MODE_KEY => Some(crate::BRIGHTNESS_MODE_MANUAL),
            _ => None,
        }
    }

    fn put_int(&self, key: &str, value: i32) -> Result<(), SettingError> {
        match (key, value) {
            (crate::SCREEN_BRIGHTNESS_KEY, _) => {}
            (crate::SCREEN_BRIGHTNESS_MODE_KEY, crate::BRIGHTNESS_MODE_MANUAL) => return Ok(()),
            _ => {
                return Err(SettingError::Unsupported {
                    key: key.to_owned(),
                })
            }
        }
        let raw = scale_to_device(value, self.backlight.max);
        debug!("setting backlight {} to {raw}/{}", self.name, self.backlight.max);
        self.session
            .set_brightness("backlight", &self.name, raw)
            .map_err(|e| classify(key, e))
    }
}

fn classify(key: &str, e: zbus::Error) -> SettingError {
    let denied = match &e {
        zbus::Error::MethodError(name, _, _) => name.as_str() == ACCESS_DENIED,
        zbus::Error::FDO(fdo) => matches!(**fdo, zbus::fdo::Error::AccessDenied(_)),
        _ => false,
    };
    if denied {
        SettingError::PermissionDenied {
            key: key.to_owned(),
            source: Some(Box::new(e)),
        }
    } else {
        SettingError::Failed {
            key: key.to_owned(),
            source: Box::new(e),
        }
    }
}
