// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Automatic HBM from an ambient light sensor.
//!
//! When the ambient light goes above a lux threshold, HBM is switched on as
//! [`HbmOwner::Auto`]. Once the light has stayed below the threshold for the
//! configured delay, it is switched off again. HBM that was switched on by
//! hand is never touched, and nothing happens while DC dimming is on.

use crate::{
    prefs::{PrefStore, SettingStore},
    switch::{HbmOwner, HbmSwitch},
};
use anyhow::{bail, Context};
use log::{debug, info, trace, warn};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

/// Lowest selectable threshold, in lux.
pub const MIN_THRESHOLD: i32 = 2000;
/// Highest selectable threshold, in lux. Also the default.
pub const MAX_THRESHOLD: i32 = 20000;
/// Threshold granularity, in lux.
pub const STEP_THRESHOLD: i32 = 2000;
/// Shortest disable delay, in seconds. Also the default.
pub const MIN_DELAY: i32 = 1;
/// Longest disable delay, in seconds.
pub const MAX_DELAY: i32 = 10;

const IIO_DEVICES: &str = "/sys/bus/iio/devices";

/// Rounds `lux` to the nearest selectable threshold.
pub fn clamp_threshold(lux: i32) -> i32 {
    let stepped = (lux.saturating_add(STEP_THRESHOLD / 2) / STEP_THRESHOLD) * STEP_THRESHOLD;
    stepped.clamp(MIN_THRESHOLD, MAX_THRESHOLD)
}

/// Limits `secs` to the selectable disable delays.
pub fn clamp_delay(secs: i32) -> i32 {
    secs.clamp(MIN_DELAY, MAX_DELAY)
}

/// Automatic HBM tuning, as stored in the preferences.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AutoHbmConfig {
    /// HBM goes on above this many lux.
    pub threshold: i32,
    /// How long the light has to stay below the threshold before HBM goes
    /// off again.
    pub disable_delay: Duration,
}

impl Default for AutoHbmConfig {
    fn default() -> Self {
        Self {
            threshold: MAX_THRESHOLD,
            disable_delay: Duration::from_secs(MIN_DELAY as u64),
        }
    }
}

impl AutoHbmConfig {
    /// Builds a config from a threshold and delay, snapping both into range.
    pub fn new(threshold: i32, delay_secs: i32) -> Self {
        Self {
            threshold: clamp_threshold(threshold),
            disable_delay: Duration::from_secs(clamp_delay(delay_secs) as u64),
        }
    }

    /// Reads the stored config. Missing values take their defaults. Stored
    /// values are used as they are, so a hand-edited file can go outside the
    /// selectable range.
    pub fn from_prefs(prefs: &impl PrefStore) -> Self {
        let defaults = Self::default();
        let threshold = prefs
            .get_int(crate::AUTO_HBM_THRESHOLD_KEY)
            .unwrap_or(defaults.threshold);
        let disable_delay = match prefs.get_int(crate::HBM_DISABLE_TIME_KEY) {
            Some(secs) => Duration::from_secs(secs.max(0) as u64),
            None => defaults.disable_delay,
        };
        Self {
            threshold,
            disable_delay,
        }
    }

    /// Stores this config.
    pub fn save(&self, prefs: &impl PrefStore) -> io::Result<()> {
        prefs.set_int(crate::AUTO_HBM_THRESHOLD_KEY, self.threshold)?;
        let secs = i32::try_from(self.disable_delay.as_secs()).unwrap_or(MAX_DELAY);
        prefs.set_int(crate::HBM_DISABLE_TIME_KEY, secs)
    }
}

/// Something that can report the ambient light level.
pub trait LightSensor {
    /// Current illuminance in lux.
    fn read_lux(&mut self) -> anyhow::Result<f64>;
}

/// An ambient light sensor exposed by the kernel's IIO subsystem.
#[derive(Clone, Debug)]
pub struct IioLightSensor {
    source: Source,
}

#[derive(Clone, Debug)]
enum Source {
    /// Driver reports processed lux.
    Input(PathBuf),
    /// Driver reports raw counts, lux = (raw + offset) * scale.
    Raw {
        raw: PathBuf,
        scale: f64,
        offset: f64,
    },
}

impl IioLightSensor {
    /// Finds the first IIO device with an illuminance channel.
    pub fn find() -> anyhow::Result<Self> {
        Self::find_in(Path::new(IIO_DEVICES))
    }

    /// Like [`find`](Self::find), looking under `devices` instead.
    pub fn find_in(devices: &Path) -> anyhow::Result<Self> {
        let dir = fs::read_dir(devices)
            .with_context(|| format!("can't access directory {}", devices.display()))?;
        let mut entries = dir.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for dirent in entries {
            let path = dirent.path();
            match Self::open(&path) {
                Ok(sensor) => return Ok(sensor),
                Err(e) => debug!("skipping {}: {e:#}", path.display()),
            }
        }
        bail!("cannot find an ambient light sensor in {}", devices.display())
    }

    /// Uses the IIO device directory at `dir`.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        let input = dir.join("in_illuminance_input");
        if input.exists() {
            return Ok(Self {
                source: Source::Input(input),
            });
        }

        let raw = dir.join("in_illuminance_raw");
        if !raw.exists() {
            bail!("{} has no illuminance channel", dir.display());
        }
        let scale = read_optional(&dir.join("in_illuminance_scale"))?.unwrap_or(1.0);
        let offset = read_optional(&dir.join("in_illuminance_offset"))?.unwrap_or(0.0);
        Ok(Self {
            source: Source::Raw { raw, scale, offset },
        })
    }
}

impl LightSensor for IioLightSensor {
    fn read_lux(&mut self) -> anyhow::Result<f64> {
        match &self.source {
            Source::Input(path) => read_number(path),
            Source::Raw { raw, scale, offset } => Ok((read_number(raw)? + offset) * scale),
        }
    }
}

fn read_number(path: &Path) -> anyhow::Result<f64> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading sensor file {}", path.display()))?;
    contents
        .trim()
        .parse()
        .with_context(|| format!("parsing {}: {contents}", path.display()))
}

fn read_optional(path: &Path) -> anyhow::Result<Option<f64>> {
    if path.exists() {
        read_number(path).map(Some)
    } else {
        Ok(None)
    }
}

/// What one [`AutoHbm::update`] did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AutoAction {
    /// Nothing to do.
    Idle,
    /// HBM was switched on.
    Enabled,
    /// Light is below the threshold, waiting out the delay.
    Pending,
    /// The delay ran out and HBM was switched off.
    Disabled,
}

/// The threshold/delay state machine.
#[derive(Debug)]
pub struct AutoHbm {
    config: AutoHbmConfig,
    active: bool,
    below_since: Option<Instant>,
}

impl AutoHbm {
    /// Starts out inactive.
    pub fn new(config: AutoHbmConfig) -> Self {
        Self {
            config,
            active: false,
            below_since: None,
        }
    }

    /// Current tuning.
    pub fn config(&self) -> &AutoHbmConfig {
        &self.config
    }

    /// Whether automatic HBM thinks HBM is on.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feeds one light reading taken at `now`.
    pub fn update<F, S>(&mut self, switch: &HbmSwitch<F, S>, lux: f64, now: Instant) -> AutoAction
    where
        F: PrefStore,
        S: SettingStore,
    {
        let threshold = f64::from(self.config.threshold);
        trace!("lux {lux}, threshold {threshold}, active {}", self.active);

        if lux > threshold {
            self.below_since = None;
            if self.active || switch.controller().flags().get_flag(crate::DC_DIMMING_KEY) {
                return AutoAction::Idle;
            }
            info!("lux {lux} > {threshold}, enabling auto HBM");
            let enabled = switch.enable_auto();
            // A manual owner also counts, so the way down gets tried once.
            self.active = enabled || switch.owner() != HbmOwner::None;
            return if enabled {
                AutoAction::Enabled
            } else {
                AutoAction::Idle
            };
        }

        if lux < threshold && self.active {
            let since = *self.below_since.get_or_insert(now);
            if now.saturating_duration_since(since) < self.config.disable_delay {
                return AutoAction::Pending;
            }
            info!("lux {lux} < {threshold} after delay, disabling auto HBM");
            self.active = false;
            self.below_since = None;
            return if switch.disable_auto() {
                AutoAction::Disabled
            } else {
                AutoAction::Idle
            };
        }

        AutoAction::Idle
    }

    /// Switches automatic HBM off, if it is on.
    pub fn stop<F: PrefStore, S: SettingStore>(&mut self, switch: &HbmSwitch<F, S>) {
        self.below_since = None;
        if std::mem::take(&mut self.active) {
            info!("stopping, disabling auto HBM");
            switch.disable_auto();
        }
    }
}

/// Polls `sensor` every `interval` until `exit` goes up, then switches
/// automatic HBM off.
pub fn run<F, S, L>(
    switch: &HbmSwitch<F, S>,
    sensor: &mut L,
    auto: &mut AutoHbm,
    interval: Duration,
    exit: &AtomicBool,
) where
    F: PrefStore,
    S: SettingStore,
    L: LightSensor,
{
    info!(
        "auto HBM running: threshold {} lux, delay {:?}",
        auto.config().threshold,
        auto.config().disable_delay
    );
    while !exit.load(Ordering::Relaxed) {
        match sensor.read_lux() {
            Ok(lux) => {
                auto.update(switch, lux, Instant::now());
            }
            Err(e) => warn!("light sensor read failed: {e:#}"),
        }
        thread::sleep(interval);
    }
    auto.stop(switch);
}
