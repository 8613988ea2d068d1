// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small library for switching a display panel's High Brightness Mode (HBM)
//! through sysfs.
//!
//! HBM is driven by writing magic values to a DRM display parameter node.
//! Turning it on also pins the raw backlight to its maximum and pushes the
//! screen brightness setting to full. HBM is mutually exclusive with DC
//! dimming: while the DC dimming preference is on, HBM requests are refused
//! outright.
//!
//! [`HbmController`] does the hardware part and nothing else. [`HbmSwitch`]
//! wraps it with the preference handling a settings UI would do: saving the
//! accepted state, backing up and restoring screen brightness, restoring HBM
//! at boot, and flipping DC dimming. The [`auto`] module switches HBM from an
//! ambient light sensor, without ever overriding a manual choice.
//!
//! Preferences and settings are reached through the [`FlagStore`],
//! [`PrefStore`] and [`SettingStore`] traits. [`PrefsFile`] implements all of
//! them with a JSON file; [`LogindBrightness`] sets screen brightness through
//! systemd-logind instead.

pub mod auto;
pub mod controller;
pub mod error;
pub mod logind;
pub mod node;
pub mod prefs;
pub mod switch;

pub use controller::HbmController;
pub use error::{SettingError, ToggleError};
pub use logind::{find_first_backlight, use_specific_backlight, Backlight, LogindBrightness};
pub use node::{Node, NodePaths};
pub use prefs::{FlagStore, PrefStore, PrefsFile, SettingStore};
pub use switch::{BootAction, HbmOwner, HbmStatus, HbmSwitch};

/// Default HBM display parameter node.
pub const HBM_NODE: &str = "/sys/class/drm/card0/card0-DSI-1/disp_param";
/// Default backlight brightness node.
pub const BACKLIGHT_NODE: &str = "/sys/class/backlight/panel0-backlight/brightness";
/// Default DC dimming node.
pub const DC_DIMMING_NODE: &str =
    "/sys/devices/platform/soc/soc:qcom,dsi-display-primary/dimlayer_exposure";

/// Written to the HBM node to turn HBM on.
pub const HBM_ON: &str = "0x10000";
/// Written to the HBM node to turn HBM off.
pub const HBM_OFF: &str = "0xF0000";
/// Raw backlight level written while HBM is on.
pub const BACKLIGHT_MAX: &str = "2047";
/// Screen brightness setting value used while HBM is on.
pub const SCREEN_BRIGHTNESS_MAX: i32 = 255;

/// Preference key of the DC dimming flag.
pub const DC_DIMMING_KEY: &str = "dc_dimming_enable";
/// Preference key of the saved HBM switch state.
pub const HBM_KEY: &str = "hbm";
/// Setting key of the screen brightness.
pub const SCREEN_BRIGHTNESS_KEY: &str = "screen_brightness";
/// Setting key of the screen brightness mode.
pub const SCREEN_BRIGHTNESS_MODE_KEY: &str = "screen_brightness_mode";
/// Brightness mode value for a fixed, user-chosen brightness.
pub const BRIGHTNESS_MODE_MANUAL: i32 = 0;
/// Brightness mode value for system-chosen brightness.
pub const BRIGHTNESS_MODE_AUTOMATIC: i32 = 1;
/// Brightness backed up when the setting store has none.
pub const DEFAULT_SAVED_BRIGHTNESS: i32 = 128;

/// Preference key of the brightness mode to restore after HBM.
pub const HBM_SAVED_MODE_KEY: &str = "hbm_saved_mode";
/// Preference key of the brightness value to restore after HBM.
pub const HBM_SAVED_VALUE_KEY: &str = "hbm_saved_value";
/// Preference key of the current HBM owner.
pub const HBM_OWNER_KEY: &str = "hbm_owner";
/// Preference key of the HBM node's mode from before DC dimming locked it.
pub const HBM_NODE_MODE_KEY: &str = "hbm_node_mode";

/// Preference key of the automatic HBM switch.
pub const AUTO_HBM_KEY: &str = "auto_hbm";
/// Preference key of the automatic HBM lux threshold.
pub const AUTO_HBM_THRESHOLD_KEY: &str = "auto_hbm_threshold";
/// Preference key of the automatic HBM disable delay, in seconds.
pub const HBM_DISABLE_TIME_KEY: &str = "hbm_disable_time";
