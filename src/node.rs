// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primitive access to sysfs nodes.
//!
//! Sysfs attributes behave like tiny files: each one holds a single value, and
//! writing replaces it. Nothing here caches anything. Every call goes back to
//! the filesystem, because the driver can change permissions or remove the
//! node underneath us at any time.

use log::debug;
use std::{
    fmt, fs,
    fs::OpenOptions,
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

/// The device nodes this crate knows how to drive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// DRM display parameter node that switches HBM.
    Hbm,
    /// Raw backlight brightness node.
    Backlight,
    /// DC dimming exposure node.
    DcDimming,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Node::Hbm => "HBM",
            Node::Backlight => "backlight",
            Node::DcDimming => "DC dimming",
        })
    }
}

/// Locations of the device nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePaths {
    /// HBM display parameter node.
    pub hbm: PathBuf,
    /// Backlight brightness node.
    pub backlight: PathBuf,
    /// DC dimming node.
    pub dc_dimming: PathBuf,
}

impl NodePaths {
    /// Path configured for `node`.
    pub fn get(&self, node: Node) -> &Path {
        match node {
            Node::Hbm => &self.hbm,
            Node::Backlight => &self.backlight,
            Node::DcDimming => &self.dc_dimming,
        }
    }
}

impl Default for NodePaths {
    fn default() -> Self {
        Self {
            hbm: PathBuf::from(crate::HBM_NODE),
            backlight: PathBuf::from(crate::BACKLIGHT_NODE),
            dc_dimming: PathBuf::from(crate::DC_DIMMING_NODE),
        }
    }
}

/// Returns `path` if it exists and this process can open it for writing.
///
/// The check opens the node without truncating or writing anything, so it has
/// no effect on the device.
pub fn probe(path: &Path) -> Option<&Path> {
    if !path.exists() {
        debug!("{} does not exist", path.display());
        return None;
    }
    match OpenOptions::new().write(true).open(path) {
        Ok(_) => Some(path),
        Err(e) => {
            debug!("{} is not writable: {e}", path.display());
            None
        }
    }
}

/// Replaces the contents of the node at `path` with exactly `payload`.
pub fn write_node(path: &Path, payload: &str) -> io::Result<()> {
    debug!("writing {payload:?} to {}", path.display());
    fs::write(path, payload)
}

/// Reads the first line of the node at `path`, trimmed. Any failure reads as
/// `None`.
pub fn read_one_line(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(contents) => contents.lines().next().map(|l| l.trim().to_owned()),
        Err(e) => {
            debug!("could not read {}: {e}", path.display());
            None
        }
    }
}

/// Permission bits of `path`.
pub fn mode(path: &Path) -> io::Result<u32> {
    Ok(fs::metadata(path)?.permissions().mode() & 0o7777)
}

/// Replaces the permission bits of `path` with `mode`.
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

/// Clears every write bit on `path`, returning the mode it had before so the
/// caller can put it back with [`set_mode`].
pub fn make_read_only(path: &Path) -> io::Result<u32> {
    let before = mode(path)?;
    set_mode(path, before & !0o222)?;
    Ok(before)
}
