// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The HBM toggle itself.

use crate::{
    error::ToggleError,
    node::{self, Node, NodePaths},
    prefs::{FlagStore, SettingStore},
};
use log::{error, info, warn};
use std::path::Path;

/// Drives the HBM and backlight nodes and the screen brightness setting.
///
/// The controller holds no state of its own. Every call re-reads the DC
/// dimming flag and re-probes the nodes, so two identical calls under
/// identical conditions perform identical writes.
#[derive(Debug)]
pub struct HbmController<F, S> {
    paths: NodePaths,
    flags: F,
    settings: S,
}

impl<F: FlagStore, S: SettingStore> HbmController<F, S> {
    /// Creates a controller for the nodes in `paths`.
    pub fn new(paths: NodePaths, flags: F, settings: S) -> Self {
        Self {
            paths,
            flags,
            settings,
        }
    }

    /// Configured node locations.
    pub fn paths(&self) -> &NodePaths {
        &self.paths
    }

    /// Preference store the DC dimming flag is read from.
    pub fn flags(&self) -> &F {
        &self.flags
    }

    /// Store the screen brightness setting goes to.
    pub fn settings(&self) -> &S {
        &self.settings
    }

    /// Returns the HBM node path if it exists and is writable.
    pub fn probe_hbm_path(&self) -> Option<&Path> {
        node::probe(&self.paths.hbm)
    }

    /// Returns the backlight node path if it exists and is writable.
    pub fn probe_backlight_path(&self) -> Option<&Path> {
        node::probe(&self.paths.backlight)
    }

    /// Whether the HBM node currently reports HBM as on.
    ///
    /// A missing node, `0`, or the disable payload all count as off.
    pub fn hbm_enabled_in_hardware(&self) -> bool {
        match node::read_one_line(&self.paths.hbm) {
            Some(v) => !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case(crate::HBM_OFF)),
            None => false,
        }
    }

    /// Switches HBM on or off, returning whether the change was accepted.
    ///
    /// Every failure is logged and turns into `false`; nothing is rolled back.
    /// See [`try_apply`](Self::try_apply) for the sequence.
    pub fn apply_toggle(&self, requested_enabled: bool) -> bool {
        match self.try_apply(requested_enabled) {
            Ok(()) => {
                info!("HBM {}", if requested_enabled { "enabled" } else { "disabled" });
                true
            }
            Err(e) => {
                log_rejection(&e);
                false
            }
        }
    }

    /// Switches HBM on or off, returning the reason on refusal.
    ///
    /// In order, stopping at the first failure:
    ///
    /// 1. Refuse while DC dimming is on.
    /// 2. Require a writable HBM node.
    /// 3. Write the enable or disable payload to it.
    /// 4. When enabling, require a writable backlight node and write the
    ///    maximum raw level to it.
    /// 5. When enabling, set the screen brightness setting to its maximum.
    ///
    /// Disabling touches only the HBM node.
    pub fn try_apply(&self, requested_enabled: bool) -> Result<(), ToggleError> {
        if self.flags.get_flag(crate::DC_DIMMING_KEY) {
            return Err(ToggleError::DcDimmingActive);
        }

        let hbm = self.require(Node::Hbm)?;
        let payload = if requested_enabled {
            crate::HBM_ON
        } else {
            crate::HBM_OFF
        };
        write(Node::Hbm, hbm, payload)?;

        if !requested_enabled {
            return Ok(());
        }

        let backlight = self.require(Node::Backlight)?;
        write(Node::Backlight, backlight, crate::BACKLIGHT_MAX)?;

        self.settings
            .put_int(crate::SCREEN_BRIGHTNESS_KEY, crate::SCREEN_BRIGHTNESS_MAX)?;

        Ok(())
    }

    fn require(&self, node: Node) -> Result<&Path, ToggleError> {
        let path = self.paths.get(node);
        node::probe(path).ok_or_else(|| ToggleError::NodeUnavailable {
            node,
            path: path.to_owned(),
        })
    }
}

fn write(node: Node, path: &Path, payload: &str) -> Result<(), ToggleError> {
    node::write_node(path, payload).map_err(|source| ToggleError::Write {
        node,
        path: path.to_owned(),
        source,
    })
}

pub(crate) fn log_rejection(e: &ToggleError) {
    match e {
        ToggleError::DcDimmingActive => {
            info!("DC dimming is on, leaving HBM alone");
        }
        ToggleError::ManualOverride => {
            info!("HBM was set by hand, automatic change skipped");
        }
        ToggleError::NodeUnavailable { .. } => {
            warn!("{e}, rejecting change");
        }
        ToggleError::Setting(s) if s.is_permission_denied() => {
            error!("no permission to write system settings: {s:?}");
        }
        ToggleError::Setting(s) => {
            error!("failed to set screen brightness: {s:?}");
        }
        ToggleError::Write { .. } | ToggleError::Persist(_) => {
            error!("{e}: {:?}", std::error::Error::source(e));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{error::SettingError, prefs::PrefStore};
    use serde_json::Value;
    use std::{
        cell::{Cell, RefCell},
        collections::HashMap,
        fs, io,
    };
    use tempfile::TempDir;

    /// In-memory preference store. With `fail_writes` set, every write fails
    /// and nothing changes.
    #[derive(Debug, Default)]
    pub(crate) struct Flags {
        pub values: RefCell<HashMap<String, Value>>,
        pub fail_writes: Cell<bool>,
    }

    impl Flags {
        pub(crate) fn with(key: &str, value: bool) -> Self {
            let f = Self::default();
            f.values.borrow_mut().insert(key.to_owned(), Value::Bool(value));
            f
        }

        pub(crate) fn has(&self, key: &str) -> bool {
            self.values.borrow().contains_key(key)
        }

        fn check(&self) -> io::Result<()> {
            if self.fail_writes.get() {
                Err(io::Error::other("disk full"))
            } else {
                Ok(())
            }
        }
    }

    impl FlagStore for Flags {
        fn get_flag(&self, key: &str) -> bool {
            matches!(self.values.borrow().get(key), Some(Value::Bool(true)))
        }

        fn set_flag(&self, key: &str, value: bool) -> io::Result<()> {
            self.set_value(key, Value::Bool(value))
        }
    }

    impl PrefStore for Flags {
        fn get_value(&self, key: &str) -> Option<Value> {
            self.values.borrow().get(key).cloned()
        }

        fn set_value(&self, key: &str, value: Value) -> io::Result<()> {
            self.check()?;
            self.values.borrow_mut().insert(key.to_owned(), value);
            Ok(())
        }

        fn remove(&self, keys: &[&str]) -> io::Result<()> {
            self.check()?;
            let mut values = self.values.borrow_mut();
            for key in keys {
                values.remove(*key);
            }
            Ok(())
        }
    }

    /// What a fake setting store should do when written.
    #[derive(Debug, Default, Clone, Copy)]
    pub(crate) enum Outcome {
        #[default]
        Ok,
        Denied,
        Broken,
    }

    /// Setting store that records writes. Accepted writes also become the
    /// current value.
    #[derive(Debug, Default)]
    pub(crate) struct Settings {
        pub outcome: Outcome,
        pub values: RefCell<HashMap<String, i32>>,
        pub writes: RefCell<Vec<(String, i32)>>,
    }

    impl Settings {
        pub(crate) fn with(pairs: &[(&str, i32)]) -> Self {
            let s = Self::default();
            for (key, value) in pairs {
                s.values.borrow_mut().insert((*key).to_owned(), *value);
            }
            s
        }
    }

    impl SettingStore for Settings {
        fn read_int(&self, key: &str) -> Option<i32> {
            self.values.borrow().get(key).copied()
        }

        fn put_int(&self, key: &str, value: i32) -> Result<(), SettingError> {
            match self.outcome {
                Outcome::Ok => {
                    self.writes.borrow_mut().push((key.to_owned(), value));
                    self.values.borrow_mut().insert(key.to_owned(), value);
                    Ok(())
                }
                Outcome::Denied => Err(SettingError::PermissionDenied {
                    key: key.to_owned(),
                    source: None,
                }),
                Outcome::Broken => Err(SettingError::Failed {
                    key: key.to_owned(),
                    source: "provider went away".into(),
                }),
            }
        }
    }

    /// Fake sysfs tree. Nodes are only created when asked for.
    pub(crate) struct Sysfs {
        pub dir: TempDir,
        pub paths: NodePaths,
    }

    pub(crate) const UNTOUCHED: &str = "untouched";

    impl Sysfs {
        pub(crate) fn new(hbm: bool, backlight: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let paths = NodePaths {
                hbm: dir.path().join("disp_param"),
                backlight: dir.path().join("brightness"),
                dc_dimming: dir.path().join("dimlayer_exposure"),
            };
            if hbm {
                fs::write(&paths.hbm, UNTOUCHED).unwrap();
            }
            if backlight {
                fs::write(&paths.backlight, UNTOUCHED).unwrap();
            }
            Self { dir, paths }
        }

        pub(crate) fn read(&self, path: &Path) -> Option<String> {
            fs::read_to_string(path).ok()
        }

        pub(crate) fn hbm(&self) -> Option<String> {
            self.read(&self.paths.hbm)
        }

        pub(crate) fn backlight(&self) -> Option<String> {
            self.read(&self.paths.backlight)
        }
    }

    #[test]
    fn dc_dimming_blocks_both_directions() {
        let sys = Sysfs::new(true, true);
        let settings = Settings::default();
        let c = HbmController::new(
            sys.paths.clone(),
            Flags::with(crate::DC_DIMMING_KEY, true),
            &settings,
        );

        assert!(!c.apply_toggle(true));
        assert!(!c.apply_toggle(false));
        assert!(matches!(c.try_apply(true), Err(ToggleError::DcDimmingActive)));

        assert_eq!(sys.hbm().as_deref(), Some(UNTOUCHED));
        assert_eq!(sys.backlight().as_deref(), Some(UNTOUCHED));
        assert!(settings.writes.borrow().is_empty());
    }

    #[test]
    fn missing_hbm_node_rejects_without_writes() {
        let sys = Sysfs::new(false, true);
        let settings = Settings::default();
        let c = HbmController::new(sys.paths.clone(), Flags::default(), &settings);

        assert_eq!(c.probe_hbm_path(), None);
        for enabled in [true, false] {
            assert!(!c.apply_toggle(enabled));
            assert!(matches!(
                c.try_apply(enabled),
                Err(ToggleError::NodeUnavailable { node: Node::Hbm, .. })
            ));
        }

        assert_eq!(sys.hbm(), None);
        assert_eq!(sys.backlight().as_deref(), Some(UNTOUCHED));
        assert!(settings.writes.borrow().is_empty());
    }

    #[test]
    fn disable_only_writes_hbm() {
        // The backlight node is absent, which must not matter when disabling.
        let sys = Sysfs::new(true, false);
        let settings = Settings::default();
        let c = HbmController::new(sys.paths.clone(), Flags::default(), &settings);

        assert!(c.apply_toggle(false));
        assert_eq!(sys.hbm().as_deref(), Some("0xF0000"));
        assert_eq!(sys.backlight(), None);
        assert!(settings.writes.borrow().is_empty());
    }

    #[test]
    fn enable_writes_everything() {
        let sys = Sysfs::new(true, true);
        let settings = Settings::default();
        let c = HbmController::new(sys.paths.clone(), Flags::default(), &settings);

        assert_eq!(c.probe_hbm_path(), Some(sys.paths.hbm.as_path()));
        assert_eq!(c.probe_backlight_path(), Some(sys.paths.backlight.as_path()));
        assert!(c.apply_toggle(true));

        assert_eq!(sys.hbm().as_deref(), Some("0x10000"));
        assert_eq!(sys.backlight().as_deref(), Some("2047"));
        assert_eq!(
            *settings.writes.borrow(),
            vec![("screen_brightness".to_owned(), 255)]
        );
    }

    #[test]
    fn missing_backlight_leaves_hbm_written() {
        let sys = Sysfs::new(true, false);
        let settings = Settings::default();
        let c = HbmController::new(sys.paths.clone(), Flags::default(), &settings);

        assert!(!c.apply_toggle(true));
        // No rollback.
        assert_eq!(sys.hbm().as_deref(), Some("0x10000"));
        assert!(settings.writes.borrow().is_empty());
        assert!(matches!(
            c.try_apply(true),
            Err(ToggleError::NodeUnavailable { node: Node::Backlight, .. })
        ));
    }

    #[test]
    fn setting_failures_reject() {
        let sys = Sysfs::new(true, true);

        let denied = Settings {
            outcome: Outcome::Denied,
            ..Default::default()
        };
        let c = HbmController::new(sys.paths.clone(), Flags::default(), &denied);
        assert!(!c.apply_toggle(true));
        match c.try_apply(true) {
            Err(ToggleError::Setting(s)) => assert!(s.is_permission_denied()),
            other => panic!("unexpected {other:?}"),
        }

        let broken = Settings {
            outcome: Outcome::Broken,
            ..Default::default()
        };
        let c = HbmController::new(sys.paths.clone(), Flags::default(), &broken);
        match c.try_apply(true) {
            Err(ToggleError::Setting(s)) => assert!(!s.is_permission_denied()),
            other => panic!("unexpected {other:?}"),
        }

        // Both nodes were still written before the setting failed.
        assert_eq!(sys.hbm().as_deref(), Some("0x10000"));
        assert_eq!(sys.backlight().as_deref(), Some("2047"));
    }

    #[test]
    fn repeated_calls_behave_the_same() {
        let sys = Sysfs::new(true, true);
        let settings = Settings::default();
        let c = HbmController::new(sys.paths.clone(), Flags::default(), &settings);

        assert!(c.apply_toggle(true));
        assert!(c.apply_toggle(true));
        assert_eq!(sys.hbm().as_deref(), Some("0x10000"));
        assert_eq!(sys.backlight().as_deref(), Some("2047"));
        assert_eq!(settings.writes.borrow().len(), 2);

        assert!(c.apply_toggle(false));
        assert!(c.apply_toggle(false));
        assert_eq!(sys.hbm().as_deref(), Some("0xF0000"));
        assert_eq!(settings.writes.borrow().len(), 2);
    }

    const DEV_FULL: &str = "/dev/full";

    #[test]
    fn hbm_write_failure_rejects() {
        if !Path::new(DEV_FULL).exists() {
            return;
        }
        let mut sys = Sysfs::new(false, true);
        sys.paths.hbm = DEV_FULL.into();
        let settings = Settings::default();
        let c = HbmController::new(sys.paths.clone(), Flags::default(), &settings);

        assert!(!c.apply_toggle(true));
        match c.try_apply(true) {
            Err(ToggleError::Write { node: Node::Hbm, path, .. }) => {
                assert_eq!(path, Path::new(DEV_FULL));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            c.try_apply(false),
            Err(ToggleError::Write { node: Node::Hbm, .. })
        ));
        assert_eq!(sys.backlight().as_deref(), Some(UNTOUCHED));
        assert!(settings.writes.borrow().is_empty());
    }

    #[test]
    fn backlight_write_failure_rejects() {
        if !Path::new(DEV_FULL).exists() {
            return;
        }
        let mut sys = Sysfs::new(true, false);
        sys.paths.backlight = DEV_FULL.into();
        let settings = Settings::default();
        let c = HbmController::new(sys.paths.clone(), Flags::default(), &settings);

        assert!(!c.apply_toggle(true));
        assert!(matches!(
            c.try_apply(true),
            Err(ToggleError::Write { node: Node::Backlight, .. })
        ));
        assert_eq!(sys.hbm().as_deref(), Some("0x10000"));
        assert!(settings.writes.borrow().is_empty());

        // Disabling never reaches the backlight.
        assert!(c.apply_toggle(false));
    }

    #[test]
    fn hardware_state_follows_node() {
        let sys = Sysfs::new(true, true);
        let c = HbmController::new(sys.paths.clone(), Flags::default(), Settings::default());

        fs::write(&sys.paths.hbm, "0\n").unwrap();
        assert!(!c.hbm_enabled_in_hardware());
        assert!(c.apply_toggle(true));
        assert!(c.hbm_enabled_in_hardware());
        assert!(c.apply_toggle(false));
        assert!(!c.hbm_enabled_in_hardware());

        fs::remove_file(&sys.paths.hbm).unwrap();
        assert!(!c.hbm_enabled_in_hardware());
    }
}
