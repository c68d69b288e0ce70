//! Generates the `Custom` AVD the emulator is launched with.

use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use super::EmulatorError;

pub(crate) const AVD_NAME: &str = "Custom";

const ABI_X86_64: &str = "x86_64";
const ABI_ARM64_V8A: &str = "arm64-v8a";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HardwareProfile {
    pub ram_size_mb: u32,
    pub core_count: u32,
    pub lcd_density: u32,
    pub lcd_width: u32,
    pub lcd_height: u32,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> EmulatorError + '_ {
    move |source| EmulatorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads `ro.product.cpu.abi` from the image's `build.prop`.
pub(crate) fn read_image_abi(system_image_dir: &Path) -> Result<String, EmulatorError> {
    let path = system_image_dir.join("build.prop");
    let text = fs::read_to_string(&path).map_err(io_error(&path))?;
    property(&text, "ro.product.cpu.abi")
        .map(str::to_string)
        .ok_or_else(|| EmulatorError::Config("ro.product.cpu.abi missing".into()))
}

fn property<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim())
}

fn cpu_arch(abi: &str) -> Result<&'static str, EmulatorError> {
    match abi {
        ABI_X86_64 => Ok("x86_64"),
        ABI_ARM64_V8A => Ok("arm64"),
        other => Err(EmulatorError::Config(format!("unknown abi {other}"))),
    }
}

pub(crate) fn config_entries(
    profile: &HardwareProfile,
    abi: &str,
    system_image_dir: &Path,
) -> Result<Vec<(&'static str, String)>, EmulatorError> {
    let arch = cpu_arch(abi)?;
    let mut sysdir = system_image_dir.to_string_lossy().into_owned();
    if !sysdir.ends_with('/') {
        sysdir.push('/');
    }

    let fixed = [
        ("AvdId", AVD_NAME),
        ("avd.ini.displayname", AVD_NAME),
        ("avd.ini.encoding", "UTF-8"),
    ];
    let hardware = [
        ("disk.dataPartition.size", "512MB"),
        ("fastboot.forceColdBoot", "no"),
        ("hw.accelerometer", "yes"),
        ("hw.audioInput", "yes"),
        ("hw.battery", "yes"),
        ("hw.camera.back", "emulated"),
        ("hw.camera.front", "emulated"),
        ("hw.dPad", "no"),
        ("hw.device.manufacturer", "Google"),
        ("hw.gps", "yes"),
        ("hw.gpu.enabled", "yes"),
        ("hw.gpu.mode", "auto"),
        ("hw.initialOrientation", "Portrait"),
        ("hw.keyboard", "yes"),
        ("hw.mainKeys", "no"),
        ("hw.sensors.orientation", "yes"),
        ("hw.sensors.proximity", "yes"),
        ("hw.trackBall", "no"),
        ("runtime.network.latency", "none"),
        ("runtime.network.speed", "full"),
    ];

    let mut entries: Vec<(&'static str, String)> =
        fixed.iter().map(|(k, v)| (*k, v.to_string())).collect();
    entries.push(("hw.ramSize", profile.ram_size_mb.to_string()));
    entries.push(("hw.cpu.ncore", profile.core_count.to_string()));
    entries.extend(hardware.iter().map(|(k, v)| (*k, v.to_string())));
    entries.push(("hw.lcd.density", profile.lcd_density.to_string()));
    entries.push(("hw.lcd.width", profile.lcd_width.to_string()));
    entries.push(("hw.lcd.height", profile.lcd_height.to_string()));
    entries.push(("abi.type", abi.to_string()));
    entries.push(("hw.cpu.arch", arch.to_string()));
    entries.push(("image.sysdir.1", sysdir));
    Ok(entries)
}

fn render(entries: &[(&str, String)]) -> String {
    let mut out = String::new();
    for (key, value) in entries {
        let _ = writeln!(out, "{key}={value}");
    }
    out
}

/// Writes `<avd_home>/Custom.ini` and `<avd_home>/Custom.avd/config.ini`. Returns the AVD
/// directory.
pub(crate) fn write_avd(
    avd_home: &Path,
    system_image_dir: &Path,
    profile: &HardwareProfile,
) -> Result<PathBuf, EmulatorError> {
    let abi = read_image_abi(system_image_dir)?;
    let entries = config_entries(profile, &abi, system_image_dir)?;

    let avd_dir = avd_home.join(format!("{AVD_NAME}.avd"));
    fs::create_dir_all(&avd_dir).map_err(io_error(&avd_dir))?;

    let pointer = avd_home.join(format!("{AVD_NAME}.ini"));
    fs::write(&pointer, format!("path={}", avd_dir.display())).map_err(io_error(&pointer))?;

    let config = avd_dir.join("config.ini");
    fs::write(&config, render(&entries)).map_err(io_error(&config))?;
    Ok(avd_dir)
}
