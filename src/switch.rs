// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The user-facing HBM switch.
//!
//! [`HbmController`] only pokes the hardware. The switch sits on top of it and
//! does what a settings screen would: remembers the accepted state, puts it
//! back after a reboot, and owns the DC dimming side of the HBM/DC dimming
//! exclusion.
//!
//! HBM has an owner. A manual switch always wins over the automatic one: the
//! ambient light loop can neither switch on HBM the user already switched on
//! (it would take the user's brightness backup) nor switch it off. The owner,
//! the screen brightness to go back to, and the HBM node's original
//! permissions are all kept in the preference store so they survive the
//! process.

use crate::{
    controller::{log_rejection, HbmController},
    error::ToggleError,
    node::{self, Node},
    prefs::{PrefStore, SettingStore},
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
};

/// Who switched HBM on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HbmOwner {
    /// HBM is off, or nobody claimed it.
    #[default]
    None,
    /// The user, through [`HbmSwitch::set`] or a boot restore.
    Manual,
    /// The ambient light loop.
    #[serde(rename = "AUTO_SERVICE")]
    Auto,
}

/// What [`HbmSwitch::restore_on_boot`] did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootAction {
    /// Hardware already matched the saved preference, or DC dimming is on.
    Unchanged,
    /// HBM was saved as on and has been switched back on.
    Enabled,
    /// HBM was left on in hardware against the saved preference and has been
    /// switched off.
    Disabled,
}

/// Snapshot of everything the switch knows about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HbmStatus {
    /// Saved HBM preference.
    pub requested: bool,
    /// What the HBM node reports.
    pub hardware: bool,
    /// Who holds HBM.
    pub owner: HbmOwner,
    /// Saved DC dimming flag.
    pub dc_dimming: bool,
    /// Whether automatic HBM is turned on.
    pub auto_hbm: bool,
    /// HBM node, if writable.
    pub hbm_node: Option<PathBuf>,
    /// Backlight node, if writable.
    pub backlight_node: Option<PathBuf>,
}

/// Preference-level wrapper around an [`HbmController`].
#[derive(Debug)]
pub struct HbmSwitch<F, S> {
    controller: HbmController<F, S>,
}

impl<F: PrefStore, S: SettingStore> HbmSwitch<F, S> {
    /// Wraps `controller`.
    pub fn new(controller: HbmController<F, S>) -> Self {
        Self { controller }
    }

    /// The wrapped controller.
    pub fn controller(&self) -> &HbmController<F, S> {
        &self.controller
    }

    fn prefs(&self) -> &F {
        self.controller.flags()
    }

    /// Current HBM owner. Anything unreadable counts as nobody.
    pub fn owner(&self) -> HbmOwner {
        self.prefs().get(crate::HBM_OWNER_KEY).unwrap_or_default()
    }

    /// Flips the switch by hand. The new state is saved only if the
    /// controller accepted it.
    ///
    /// Switching on remembers the screen brightness mode and value (unless
    /// HBM was already held) and switching off puts them back.
    pub fn set(&self, enabled: bool) -> bool {
        let result = if enabled {
            self.enable_as(HbmOwner::Manual)
        } else {
            self.disable_as(HbmOwner::Manual)
        };
        report(enabled, result)
    }

    /// Switches HBM on for the ambient light loop. Refused while HBM is held
    /// manually.
    pub fn enable_auto(&self) -> bool {
        report(true, self.enable_as(HbmOwner::Auto))
    }

    /// Switches HBM off for the ambient light loop. Refused while HBM is held
    /// manually.
    pub fn disable_auto(&self) -> bool {
        report(false, self.disable_as(HbmOwner::Auto))
    }

    fn enable_as(&self, owner: HbmOwner) -> Result<(), ToggleError> {
        let current = self.owner();
        debug!("enable: owner={owner:?}, current={current:?}");
        if current == HbmOwner::Manual && owner == HbmOwner::Auto {
            return Err(ToggleError::ManualOverride);
        }
        if current == owner && self.controller.hbm_enabled_in_hardware() {
            debug!("HBM already held by {owner:?}");
            return Ok(());
        }

        let saved = current == HbmOwner::None && self.save_brightness();
        if let Err(e) = self.controller.try_apply(true) {
            if saved {
                self.forget_brightness();
            }
            return Err(e);
        }

        let manual = self
            .controller
            .settings()
            .put_int(crate::SCREEN_BRIGHTNESS_MODE_KEY, crate::BRIGHTNESS_MODE_MANUAL);
        if let Err(e) = manual {
            warn!("could not switch brightness to manual mode: {e}");
        }

        let prefs = self.prefs();
        let mut persisted = prefs.set(crate::HBM_OWNER_KEY, &owner);
        if owner == HbmOwner::Manual {
            persisted = persisted.and_then(|()| prefs.set_flag(crate::HBM_KEY, true));
        }
        if let Err(e) = persisted {
            // Hardware already changed, so the toggle still counts.
            warn!("HBM switched but saving the preference failed: {e}");
        }
        Ok(())
    }

    fn disable_as(&self, owner: HbmOwner) -> Result<(), ToggleError> {
        let current = self.owner();
        debug!("disable: owner={owner:?}, current={current:?}");
        if current == HbmOwner::None && !self.controller.hbm_enabled_in_hardware() {
            debug!("HBM already off");
            return Ok(());
        }
        if owner == HbmOwner::Auto && current == HbmOwner::Manual {
            return Err(ToggleError::ManualOverride);
        }

        self.controller.try_apply(false)?;
        self.restore_brightness();

        let prefs = self.prefs();
        let mut persisted = prefs.remove(&[
            crate::HBM_SAVED_MODE_KEY,
            crate::HBM_SAVED_VALUE_KEY,
            crate::HBM_OWNER_KEY,
        ]);
        if owner == HbmOwner::Manual || current == HbmOwner::Manual {
            persisted = persisted.and_then(|()| prefs.set_flag(crate::HBM_KEY, false));
        }
        if let Err(e) = persisted {
            warn!("HBM switched but saving the preference failed: {e}");
        }
        Ok(())
    }

    /// Stores the current brightness mode and value. Returns whether they
    /// were stored.
    fn save_brightness(&self) -> bool {
        let settings = self.controller.settings();
        let mode = settings
            .read_int(crate::SCREEN_BRIGHTNESS_MODE_KEY)
            .unwrap_or(crate::BRIGHTNESS_MODE_MANUAL);
        let value = settings
            .read_int(crate::SCREEN_BRIGHTNESS_KEY)
            .unwrap_or(crate::DEFAULT_SAVED_BRIGHTNESS);
        info!("saving brightness: mode={mode}, value={value}");

        let prefs = self.prefs();
        let stored = prefs
            .set_int(crate::HBM_SAVED_MODE_KEY, mode)
            .and_then(|()| prefs.set_int(crate::HBM_SAVED_VALUE_KEY, value));
        match stored {
            Ok(()) => true,
            Err(e) => {
                warn!("could not save brightness, it will not be restored: {e}");
                false
            }
        }
    }

    fn forget_brightness(&self) {
        if let Err(e) = self
            .prefs()
            .remove(&[crate::HBM_SAVED_MODE_KEY, crate::HBM_SAVED_VALUE_KEY])
        {
            warn!("could not clear brightness backup: {e}");
        }
    }

    /// Puts back what [`save_brightness`](Self::save_brightness) stored. The
    /// value only goes back if the screen ends up in manual mode, because in
    /// automatic mode the system picks its own. Without a backup nothing
    /// changes.
    fn restore_brightness(&self) {
        let settings = self.controller.settings();
        let prefs = self.prefs();

        let mode = settings
            .read_int(crate::SCREEN_BRIGHTNESS_MODE_KEY)
            .unwrap_or(crate::BRIGHTNESS_MODE_MANUAL);
        let saved_mode = prefs.get_int(crate::HBM_SAVED_MODE_KEY);
        if let (crate::BRIGHTNESS_MODE_MANUAL, Some(saved)) = (mode, saved_mode) {
            info!("restoring brightness mode {saved}");
            if let Err(e) = settings.put_int(crate::SCREEN_BRIGHTNESS_MODE_KEY, saved) {
                warn!("could not restore brightness mode: {e}");
            }
        }

        let mode = settings
            .read_int(crate::SCREEN_BRIGHTNESS_MODE_KEY)
            .unwrap_or(crate::BRIGHTNESS_MODE_MANUAL);
        if let Some(value) = prefs.get_int(crate::HBM_SAVED_VALUE_KEY) {
            if mode == crate::BRIGHTNESS_MODE_MANUAL {
                info!("restoring brightness {value}");
                if let Err(e) = settings.put_int(crate::SCREEN_BRIGHTNESS_KEY, value) {
                    warn!("could not restore brightness: {e}");
                }
            }
        }
    }

    /// Brings the hardware back in line with the saved preference.
    ///
    /// A leftover brightness backup is thrown away when HBM is off on both
    /// sides, since there is nothing left to restore it after.
    pub fn restore_on_boot(&self) -> Result<BootAction, ToggleError> {
        let prefs = self.prefs();
        let wanted = prefs.get_flag(crate::HBM_KEY);
        let hardware = self.controller.hbm_enabled_in_hardware();
        info!("boot: preference={wanted}, hardware={hardware}");

        match (wanted, hardware) {
            (true, false) if !prefs.get_flag(crate::DC_DIMMING_KEY) => {
                info!("restoring HBM");
                self.enable_as(HbmOwner::Manual)?;
                Ok(BootAction::Enabled)
            }
            (true, true) => {
                if self.owner() == HbmOwner::None {
                    if let Err(e) = prefs.set(crate::HBM_OWNER_KEY, &HbmOwner::Manual) {
                        warn!("could not save HBM owner: {e}");
                    }
                }
                Ok(BootAction::Unchanged)
            }
            (false, true) => {
                info!("HBM left on in hardware, turning it off");
                self.disable_as(HbmOwner::Manual)?;
                Ok(BootAction::Disabled)
            }
            (false, false) => {
                let stale = prefs.remove(&[
                    crate::HBM_SAVED_MODE_KEY,
                    crate::HBM_SAVED_VALUE_KEY,
                    crate::HBM_OWNER_KEY,
                ]);
                if let Err(e) = stale {
                    warn!("could not clear stale HBM state: {e}");
                }
                Ok(BootAction::Unchanged)
            }
            (true, false) => Ok(BootAction::Unchanged),
        }
    }

    /// Turns DC dimming on or off.
    ///
    /// Turning it on first switches HBM off (if it is on) and then makes the
    /// HBM node read-only, remembering its mode. Turning it off puts that mode
    /// back. If HBM refuses to go off, or the new state cannot be saved, the
    /// DC dimming node gets its old value back and the error is returned.
    pub fn set_dc_dimming(&self, enabled: bool) -> Result<(), ToggleError> {
        let paths = self.controller.paths();
        let Some(dc) = node::probe(&paths.dc_dimming) else {
            return Err(ToggleError::NodeUnavailable {
                node: Node::DcDimming,
                path: paths.dc_dimming.clone(),
            });
        };

        debug!("setting DC dimming: {enabled}");
        let previous = node::read_one_line(dc);
        node::write_node(dc, dc_payload(enabled)).map_err(|source| ToggleError::Write {
            node: Node::DcDimming,
            path: dc.to_owned(),
            source,
        })?;

        let prefs = self.prefs();
        if enabled && self.controller.hbm_enabled_in_hardware() {
            // Must happen before the flag goes up, or the controller refuses.
            if let Err(e) = self.disable_as(HbmOwner::Manual) {
                error!("HBM disable failed, rolling back DC dimming: {e}");
                roll_back_dc(dc, previous.as_deref(), enabled);
                return Err(e);
            }
        }

        let persisted = if enabled {
            prefs.set_flag(crate::HBM_KEY, false)
        } else {
            Ok(())
        }
        .and_then(|()| prefs.set_flag(crate::DC_DIMMING_KEY, enabled));
        if let Err(e) = persisted {
            error!("could not save DC dimming, rolling back: {e}");
            roll_back_dc(dc, previous.as_deref(), enabled);
            return Err(ToggleError::Persist(e));
        }

        let hbm = &paths.hbm;
        let locked = if enabled {
            self.lock_hbm_node(hbm)
        } else {
            self.unlock_hbm_node(hbm)
        };
        if let Err(e) = locked {
            warn!("could not change permissions of {}: {e}", hbm.display());
        }
        Ok(())
    }

    fn lock_hbm_node(&self, hbm: &Path) -> io::Result<()> {
        let prefs = self.prefs();
        if prefs.get_int(crate::HBM_NODE_MODE_KEY).is_some() {
            // Locked already; its mode from before is what we want back.
            return node::set_mode(hbm, node::mode(hbm)? & !0o222);
        }
        // A node that is somehow read-only already still has to come back
        // writable.
        let before = node::make_read_only(hbm)? | 0o200;
        prefs.set_int(crate::HBM_NODE_MODE_KEY, before as i32)
    }

    fn unlock_hbm_node(&self, hbm: &Path) -> io::Result<()> {
        let prefs = self.prefs();
        match prefs.get_int(crate::HBM_NODE_MODE_KEY) {
            Some(mode) => {
                node::set_mode(hbm, mode as u32)?;
                prefs.remove(&[crate::HBM_NODE_MODE_KEY])
            }
            None => node::set_mode(hbm, node::mode(hbm)? | 0o200),
        }
    }

    /// Current saved and hardware state.
    pub fn status(&self) -> HbmStatus {
        let prefs = self.prefs();
        HbmStatus {
            requested: prefs.get_flag(crate::HBM_KEY),
            hardware: self.controller.hbm_enabled_in_hardware(),
            owner: self.owner(),
            dc_dimming: prefs.get_flag(crate::DC_DIMMING_KEY),
            auto_hbm: prefs.get_flag(crate::AUTO_HBM_KEY),
            hbm_node: self.controller.probe_hbm_path().map(ToOwned::to_owned),
            backlight_node: self.controller.probe_backlight_path().map(ToOwned::to_owned),
        }
    }
}

fn report(enabled: bool, result: Result<(), ToggleError>) -> bool {
    match result {
        Ok(()) => {
            info!("HBM {}", if enabled { "enabled" } else { "disabled" });
            true
        }
        Err(e) => {
            log_rejection(&e);
            false
        }
    }
}

fn dc_payload(enabled: bool) -> &'static str {
    if enabled {
        "1"
    } else {
        "0"
    }
}

fn roll_back_dc(dc: &Path, previous: Option<&str>, enabled: bool) {
    let payload = previous.unwrap_or(dc_payload(!enabled));
    if let Err(e) = node::write_node(dc, payload) {
        error!("failed to roll back DC dimming node: {e}");
    }
}
