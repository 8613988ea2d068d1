// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simple program for switching a display panel's High Brightness Mode.
//!
//! Needs write access to the panel's sysfs nodes, which in practice means
//! running as root or from a udev-granted group.

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use hbmctl::{
    auto::{self, AutoHbm, AutoHbmConfig, IioLightSensor},
    BootAction, FlagStore, HbmController, HbmOwner, HbmSwitch, LogindBrightness, NodePaths,
    PrefsFile, SettingError, SettingStore,
};
use std::{
    ffi::OsString,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Switch display High Brightness Mode. HBM is refused while DC dimming is on.
#[derive(Parser)]
#[clap(version)]
struct Hbmctl {
    /// File holding the saved HBM and DC dimming preferences.
    #[clap(
        long,
        global = true,
        env = "HBMCTL_PREFS",
        default_value = "/var/lib/hbmctl/prefs.json"
    )]
    prefs: PathBuf,

    /// File receiving the screen brightness setting. Ignored with --logind.
    #[clap(
        long,
        global = true,
        env = "HBMCTL_SETTINGS",
        default_value = "/var/lib/hbmctl/settings.json"
    )]
    settings: PathBuf,

    /// Apply the screen brightness setting through logind instead of a file.
    #[clap(long, global = true, env = "HBMCTL_LOGIND")]
    logind: bool,

    /// Name of the backlight device logind should adjust. Use this to override
    /// the automatic detection logic.
    #[clap(long, global = true, env = "HBMCTL_BACKLIGHT_NAME")]
    backlight_name: Option<OsString>,

    /// HBM display parameter node.
    #[clap(
        long,
        global = true,
        env = "HBMCTL_HBM_NODE",
        default_value = hbmctl::HBM_NODE
    )]
    hbm_node: PathBuf,

    /// Raw backlight brightness node.
    #[clap(
        long,
        global = true,
        env = "HBMCTL_BACKLIGHT_NODE",
        default_value = hbmctl::BACKLIGHT_NODE
    )]
    backlight_node: PathBuf,

    /// DC dimming node.
    #[clap(
        long,
        global = true,
        env = "HBMCTL_DC_DIMMING_NODE",
        default_value = hbmctl::DC_DIMMING_NODE
    )]
    dc_dimming_node: PathBuf,

    #[clap(subcommand)]
    cmd: SubCmd,
}

#[derive(Clone, Debug, Parser)]
enum SubCmd {
    /// Turn HBM on.
    On,
    /// Turn HBM off.
    Off,
    /// Print saved and hardware state.
    Status,
    /// Bring the hardware back in line with the saved preference. Meant to run
    /// once at boot.
    Restore,
    /// Turn DC dimming on or off. Turning it on switches HBM off first.
    DcDimming {
        /// New DC dimming state.
        state: OnOff,
    },
    /// Configure automatic HBM from the ambient light sensor.
    AutoSet {
        /// Whether automatic HBM may run at all.
        state: OnOff,
        /// Lux above which HBM goes on. Rounded to a multiple of 2000 between
        /// 2000 and 20000.
        #[clap(long)]
        threshold: Option<i32>,
        /// Seconds the light has to stay below the threshold before HBM goes
        /// off again, 1 to 10.
        #[clap(long)]
        delay: Option<i32>,
    },
    /// Run automatic HBM until interrupted. Does nothing unless enabled with
    /// auto-set.
    AutoRun {
        /// IIO device directory of the light sensor. Found automatically if
        /// not given.
        #[clap(long, env = "HBMCTL_SENSOR")]
        sensor: Option<PathBuf>,
        /// How often to read the sensor, in milliseconds.
        #[clap(long, default_value_t = 500)]
        interval_ms: u64,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OnOff {
    On,
    Off,
}

/// Where the screen brightness setting goes.
#[derive(Debug)]
enum Settings {
    File(PrefsFile),
    Logind(LogindBrightness),
}

impl SettingStore for Settings {
    fn read_int(&self, key: &str) -> Option<i32> {
        match self {
            Settings::File(f) => f.read_int(key),
            Settings::Logind(l) => l.read_int(key),
        }
    }

    fn put_int(&self, key: &str, value: i32) -> Result<(), SettingError> {
        match self {
            Settings::File(f) => f.put_int(key, value),
            Settings::Logind(l) => l.put_int(key, value),
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Hbmctl::parse();

    let paths = NodePaths {
        hbm: args.hbm_node,
        backlight: args.backlight_node,
        dc_dimming: args.dc_dimming_node,
    };
    let prefs = PrefsFile::new(args.prefs);

    // DBus is only touched with --logind.
    let settings = if args.logind {
        let (backlight, _current) = if let Some(name) = args.backlight_name {
            hbmctl::use_specific_backlight(name)?
        } else {
            hbmctl::find_first_backlight()?
        };
        Settings::Logind(LogindBrightness::connect(backlight)?)
    } else {
        Settings::File(PrefsFile::new(args.settings))
    };

    let switch = HbmSwitch::new(HbmController::new(paths, prefs, settings));

    match args.cmd {
        SubCmd::On => toggle(&switch, true)?,
        SubCmd::Off => toggle(&switch, false)?,
        SubCmd::Status => {
            let status = switch.status();
            let show = |p: &Option<PathBuf>| match p {
                Some(p) => p.display().to_string(),
                None => "unavailable".to_owned(),
            };
            let owner = match status.owner {
                HbmOwner::None => "none",
                HbmOwner::Manual => "manual",
                HbmOwner::Auto => "auto",
            };
            let config = AutoHbmConfig::from_prefs(switch.controller().flags());
            println!("hbm: {}", on_off(status.requested));
            println!("hardware: {}", on_off(status.hardware));
            println!("owner: {owner}");
            println!("dc dimming: {}", on_off(status.dc_dimming));
            println!(
                "auto hbm: {} (above {} lux, off after {}s)",
                on_off(status.auto_hbm),
                config.threshold,
                config.disable_delay.as_secs()
            );
            println!("hbm node: {}", show(&status.hbm_node));
            println!("backlight node: {}", show(&status.backlight_node));
        }
        SubCmd::Restore => {
            let action = switch
                .restore_on_boot()
                .context("can't restore HBM state")?;
            match action {
                BootAction::Unchanged => println!("unchanged"),
                BootAction::Enabled => println!("enabled"),
                BootAction::Disabled => println!("disabled"),
            }
        }
        SubCmd::DcDimming { state } => {
            let enabled = matches!(state, OnOff::On);
            switch
                .set_dc_dimming(enabled)
                .context("can't change DC dimming")?;
            // Report what the preference now says rather than what we asked.
            let now = switch.controller().flags().get_flag(hbmctl::DC_DIMMING_KEY);
            println!("dc dimming: {}", on_off(now));
        }
        SubCmd::AutoSet {
            state,
            threshold,
            delay,
        } => {
            let prefs = switch.controller().flags();
            let old = AutoHbmConfig::from_prefs(prefs);
            let config = AutoHbmConfig::new(
                threshold.unwrap_or(old.threshold),
                delay.unwrap_or(old.disable_delay.as_secs() as i32),
            );
            config.save(prefs).context("can't save auto HBM settings")?;
            prefs
                .set_flag(hbmctl::AUTO_HBM_KEY, matches!(state, OnOff::On))
                .context("can't save auto HBM settings")?;
            println!(
                "auto hbm: {} (above {} lux, off after {}s)",
                on_off(matches!(state, OnOff::On)),
                config.threshold,
                config.disable_delay.as_secs()
            );
        }
        SubCmd::AutoRun {
            sensor,
            interval_ms,
        } => {
            let prefs = switch.controller().flags();
            if !prefs.get_flag(hbmctl::AUTO_HBM_KEY) {
                bail!("automatic HBM is off (turn it on with auto-set on)");
            }
            let mut sensor = match sensor {
                Some(dir) => IioLightSensor::open(&dir)?,
                None => IioLightSensor::find()?,
            };

            let exit = Arc::new(AtomicBool::new(false));
            let handler_exit = Arc::clone(&exit);
            ctrlc::set_handler(move || handler_exit.store(true, Ordering::Relaxed))
                .context("can't install signal handler")?;

            let mut auto_hbm = AutoHbm::new(AutoHbmConfig::from_prefs(prefs));
            auto::run(
                &switch,
                &mut sensor,
                &mut auto_hbm,
                Duration::from_millis(interval_ms),
                &exit,
            );
        }
    }

    Ok(())
}

fn toggle(switch: &HbmSwitch<PrefsFile, Settings>, enabled: bool) -> anyhow::Result<()> {
    if !switch.set(enabled) {
        bail!("HBM change rejected (see log for the reason)");
    }
    Ok(())
}

fn on_off(b: bool) -> &'static str {
    if b {
        "on"
    } else {
        "off"
    }
}
