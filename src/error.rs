// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types.

use crate::node::Node;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Boxed error from a setting backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Reasons an HBM toggle (or a DC dimming change) can be refused.
#[derive(Debug, Error)]
pub enum ToggleError {
    /// DC dimming is on, and HBM must stay untouched while it is.
    #[error("DC dimming is enabled")]
    DcDimmingActive,

    /// Automatic HBM tried to change a state that was set by hand.
    #[error("HBM is held by a manual setting")]
    ManualOverride,

    /// A required node is missing or not writable.
    #[error("{node} node {} not available or not writable", .path.display())]
    NodeUnavailable {
        /// Which node.
        node: Node,
        /// Where we looked for it.
        path: PathBuf,
    },

    /// Writing a node failed.
    #[error("failed to write {node} node {}", .path.display())]
    Write {
        /// Which node.
        node: Node,
        /// Where it lives.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Updating a system setting failed.
    #[error(transparent)]
    Setting(#[from] SettingError),

    /// Saving a preference failed.
    #[error("failed to save preference")]
    Persist(#[source] io::Error),
}

/// Failure to write a system setting.
#[derive(Debug, Error)]
pub enum SettingError {
    /// The backend refused us access.
    #[error("no permission to write setting {key}")]
    PermissionDenied {
        /// Setting key.
        key: String,
        /// Backend error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Any other backend failure.
    #[error("failed to set {key}")]
    Failed {
        /// Setting key.
        key: String,
        /// Backend error.
        #[source]
        source: BoxError,
    },

    /// The backend has no such setting.
    #[error("setting {key} is not supported by this backend")]
    Unsupported {
        /// Setting key.
        key: String,
    },
}

impl SettingError {
    /// Classifies an I/O error raised while writing setting `key`.
    pub fn from_io(key: &str, e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::PermissionDenied {
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

    /// Whether this is an access problem rather than a generic failure.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, SettingError::PermissionDenied { .. })
    }
}
