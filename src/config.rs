//! Stimulus configuration: validation, the named-parameter accessor, and the
//! versioned shared config read by producer threads.

use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// How raw entropy becomes pixel values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandMode {
    Uniform,
    Gaussian,
    Binary,
}

impl FromStr for RandMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniform" => Ok(Self::Uniform),
            "gaussian" => Ok(Self::Gaussian),
            "binary" => Ok(Self::Binary),
            other => Err(format!("unknown rand mode '{other}'")),
        }
    }
}

/// How many logical frames are packed into one physical refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubFrameMode {
    Single,
    Dual,
    Triple,
}

impl SubFrameMode {
    /// Entropy words drawn per pixel in gaussian mode.
    pub fn words_per_pixel(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Dual => 2,
            Self::Triple => 3,
        }
    }
}

impl FromStr for SubFrameMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "dual" => Ok(Self::Dual),
            "triple" => Ok(Self::Triple),
            other => Err(format!("unknown sub-frame mode '{other}'")),
        }
    }
}

/// Unused border around the stixel grid, in display pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Margins {
    #[serde(default)]
    pub left: u32,
    #[serde(default)]
    pub right: u32,
    #[serde(default)]
    pub bottom: u32,
    #[serde(default)]
    pub top: u32,
}

/// Photodiode frame-track marker box placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameTrackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub x: u32,
    #[serde(default)]
    pub y: u32,
    #[serde(default = "default_track_size")]
    pub size: u32,
}

fn default_track_size() -> u32 {
    20
}

impl Default for FrameTrackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            x: 0,
            y: 0,
            size: default_track_size(),
        }
    }
}

/// Full stimulus parameter set.
///
/// Field names mirror the external control-protocol parameter names where one
/// exists (`stixel_width` = `stixelwidth`, `rand_mode` = `rand_gen`,
/// `cache_depth` = `fbo`, `color_table_size` = `colortable`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StimConfig {
    pub display_width: u32,
    pub display_height: u32,
    #[serde(alias = "stixelwidth")]
    pub stixel_width: u32,
    #[serde(alias = "stixelheight")]
    pub stixel_height: u32,
    #[serde(default = "default_rand_mode", alias = "rand_gen")]
    pub rand_mode: RandMode,
    #[serde(default = "default_contrast")]
    pub contrast: f32,
    #[serde(default = "default_background", alias = "bgcolor")]
    pub background: f32,
    #[serde(default)]
    pub margins: Margins,
    #[serde(default, alias = "rand_displacement_x")]
    pub displacement_x: u32,
    #[serde(default, alias = "rand_displacement_y")]
    pub displacement_y: u32,
    #[serde(default = "default_sub_frame", alias = "fps_mode")]
    pub sub_frame: SubFrameMode,
    #[serde(default = "default_color_table_size", alias = "colortable")]
    pub color_table_size: usize,
    #[serde(default = "default_cache_depth", alias = "fbo")]
    pub cache_depth: usize,
    #[serde(default = "default_cores")]
    pub cores: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub frame_track: FrameTrackConfig,
}

fn default_rand_mode() -> RandMode {
    RandMode::Uniform
}

fn default_contrast() -> f32 {
    1.0
}

fn default_background() -> f32 {
    0.5
}

fn default_sub_frame() -> SubFrameMode {
    SubFrameMode::Single
}

fn default_color_table_size() -> usize {
    1 << 15
}

fn default_cache_depth() -> usize {
    30
}

fn default_cores() -> usize {
    2
}

impl StimConfig {
    /// Grid dimensions in stixels derived from the usable display area.
    pub fn grid(&self) -> (u32, u32) {
        let usable_w = self
            .display_width
            .saturating_sub(self.margins.left.saturating_add(self.margins.right));
        let usable_h = self
            .display_height
            .saturating_sub(self.margins.bottom.saturating_add(self.margins.top));
        (usable_w / self.stixel_width.max(1), usable_h / self.stixel_height.max(1))
    }

    /// Producer threads implied by the total thread budget.
    pub fn producer_count(&self) -> usize {
        self.cores.saturating_sub(1)
    }

    /// Validate the whole parameter set before any thread or GPU work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.contrast) {
            return Err(ConfigError::ContrastOutOfRange(self.contrast));
        }
        if !(0.0..=1.0).contains(&self.background) {
            return Err(ConfigError::BackgroundOutOfRange(self.background));
        }
        if self.stixel_width == 0 || self.stixel_height == 0 {
            return Err(ConfigError::DegenerateGrid { nx: 0, ny: 0 });
        }
        let (nx, ny) = self.grid();
        if nx == 0 || ny == 0 {
            return Err(ConfigError::DegenerateGrid { nx, ny });
        }
        if !self.color_table_size.is_power_of_two() || self.color_table_size <= 2048 {
            return Err(ConfigError::BadColorTableSize(self.color_table_size));
        }
        if self.cache_depth == 0 {
            return Err(ConfigError::ZeroCacheDepth);
        }
        if self.cores == 0 {
            return Err(ConfigError::ZeroCores);
        }
        let available = available_cores();
        if self.cores > available {
            return Err(ConfigError::CoresExceedHardware {
                requested: self.cores,
                available,
            });
        }
        Ok(())
    }

    /// First critical field (one that requires a full stop/reinit) on which
    /// `self` and `other` differ, if any.
    pub fn critical_diff(&self, other: &StimConfig) -> Option<&'static str> {
        if self.grid() != other.grid()
            || self.display_width != other.display_width
            || self.display_height != other.display_height
        {
            return Some("grid resolution");
        }
        if self.cache_depth != other.cache_depth {
            return Some("cache depth");
        }
        if self.cores != other.cores {
            return Some("cores");
        }
        if self.color_table_size != other.color_table_size {
            return Some("color table size");
        }
        if self.sub_frame != other.sub_frame {
            return Some("sub-frame mode");
        }
        None
    }

    /// Field-level diff against `previous`, as (name, old, new) strings, for
    /// the parameter history record.
    pub fn diff(&self, previous: &StimConfig) -> Vec<(String, String, String)> {
        fn push(
            out: &mut Vec<(String, String, String)>,
            name: &str,
            old: impl Display,
            new: impl Display,
        ) {
            let old = old.to_string();
            let new = new.to_string();
            if old != new {
                out.push((name.to_string(), old, new));
            }
        }

        let mut out = Vec::new();
        push(&mut out, "stixelwidth", previous.stixel_width, self.stixel_width);
        push(&mut out, "stixelheight", previous.stixel_height, self.stixel_height);
        push(
            &mut out,
            "rand_gen",
            format!("{:?}", previous.rand_mode),
            format!("{:?}", self.rand_mode),
        );
        push(&mut out, "contrast", previous.contrast, self.contrast);
        push(&mut out, "bgcolor", previous.background, self.background);
        push(&mut out, "rand_displacement_x", previous.displacement_x, self.displacement_x);
        push(&mut out, "rand_displacement_y", previous.displacement_y, self.displacement_y);
        push(
            &mut out,
            "fps_mode",
            format!("{:?}", previous.sub_frame),
            format!("{:?}", self.sub_frame),
        );
        push(&mut out, "colortable", previous.color_table_size, self.color_table_size);
        push(&mut out, "fbo", previous.cache_depth, self.cache_depth);
        push(&mut out, "cores", previous.cores, self.cores);
        push(&mut out, "seed", previous.seed, self.seed);
        push(
            &mut out,
            "margins",
            format!("{:?}", previous.margins),
            format!("{:?}", self.margins),
        );
        out
    }

    /// Apply control-protocol style `name=value` overrides.
    pub fn apply_params(&mut self, params: &ParamMap) -> Result<(), ConfigError> {
        if let Some(v) = params.get("stixelwidth")? {
            self.stixel_width = v;
        }
        if let Some(v) = params.get("stixelheight")? {
            self.stixel_height = v;
        }
        if let Some(v) = params.get::<RandMode>("rand_gen")? {
            self.rand_mode = v;
        }
        if let Some(v) = params.get("contrast")? {
            self.contrast = v;
        }
        if let Some(v) = params.get("bgcolor")? {
            self.background = v;
        }
        if let Some(v) = params.get("rand_displacement_x")? {
            self.displacement_x = v;
        }
        if let Some(v) = params.get("rand_displacement_y")? {
            self.displacement_y = v;
        }
        if let Some(v) = params.get::<SubFrameMode>("fps_mode")? {
            self.sub_frame = v;
        }
        if let Some(v) = params.get("colortable")? {
            self.color_table_size = v;
        }
        if let Some(v) = params.get("fbo")? {
            self.cache_depth = v;
        }
        if let Some(v) = params.get("cores")? {
            self.cores = v;
        }
        if let Some(v) = params.get("seed")? {
            self.seed = v;
        }
        Ok(())
    }
}

/// Hardware parallelism available to the thread budget check.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Config rejection taxonomy. Every variant is surfaced synchronously to the
/// caller that requested start or reapply; nothing here is a runtime panic.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    ContrastOutOfRange(f32),
    BackgroundOutOfRange(f32),
    BadColorTableSize(usize),
    DegenerateGrid { nx: u32, ny: u32 },
    ZeroCacheDepth,
    ZeroCores,
    CoresExceedHardware { requested: usize, available: usize },
    CriticalFieldWhileRunning(&'static str),
    CoresChangeWithPendingHistory,
    BadParam { name: String, value: String, reason: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ContrastOutOfRange(v) => write!(f, "contrast {v} outside [0,1]"),
            Self::BackgroundOutOfRange(v) => write!(f, "bgcolor {v} outside [0,1]"),
            Self::BadColorTableSize(size) => write!(
                f,
                "colortable size {size} must be a power of two greater than 2048"
            ),
            Self::DegenerateGrid { nx, ny } => {
                write!(f, "stixel grid {nx}x{ny} has no usable area")
            }
            Self::ZeroCacheDepth => write!(f, "fbo (cache depth) must be at least 1"),
            Self::ZeroCores => write!(f, "cores must be at least 1"),
            Self::CoresExceedHardware {
                requested,
                available,
            } => write!(
                f,
                "cores={requested} exceeds available parallelism ({available})"
            ),
            Self::CriticalFieldWhileRunning(field) => write!(
                f,
                "changing {field} requires a stop/restart; change rejected"
            ),
            Self::CoresChangeWithPendingHistory => write!(
                f,
                "cannot raise cores above 2 while parameter history commits are pending"
            ),
            Self::BadParam {
                name,
                value,
                reason,
            } => write!(f, "parameter '{name}' rejected value '{value}': {reason}"),
        }
    }
}

impl Error for ConfigError {}

/// Named-parameter accessor: typed `get(name)` over string values, with an
/// optional scoping suffix tried before the bare name.
#[derive(Debug, Clone, Default)]
pub struct ParamMap {
    values: HashMap<String, String>,
    scope: Option<String>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(scope: impl Into<String>) -> Self {
        Self {
            values: HashMap::new(),
            scope: Some(scope.into()),
        }
    }

    /// Parse a `name=value` pair into the map.
    pub fn set_pair(&mut self, raw: &str) -> Result<(), ConfigError> {
        let (name, value) = raw.split_once('=').ok_or_else(|| ConfigError::BadParam {
            name: raw.to_string(),
            value: String::new(),
            reason: "expected name=value".to_string(),
        })?;
        self.set(name.trim(), value.trim());
        Ok(())
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    /// Typed lookup. The scoped spelling (`name_scope`) wins over the bare
    /// name; a missing parameter is `Ok(None)` so callers can keep defaults.
    pub fn get<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: Display,
    {
        let raw = self
            .scope
            .as_ref()
            .and_then(|scope| self.values.get(&format!("{name}_{scope}")))
            .or_else(|| self.values.get(name));
        match raw {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::BadParam {
                name: name.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Typed lookup with a default for missing parameters.
    pub fn get_or<T: FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T::Err: Display,
    {
        Ok(self.get(name)?.unwrap_or(default))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

struct VersionedConfig {
    config: StimConfig,
    serial: u64,
}

/// Process-wide configuration behind a reader/writer lock, paired with the
/// monotonically increasing parameter serial.
///
/// Producers take the reader lock only for the instant of snapshotting; the
/// writer lock is held only across install-and-bump. All acquisition is
/// scoped, so no lock ever outlives its call site.
pub struct SharedConfig {
    inner: RwLock<VersionedConfig>,
}

impl SharedConfig {
    pub fn new(config: StimConfig) -> Self {
        Self {
            inner: RwLock::new(VersionedConfig { config, serial: 0 }),
        }
    }

    /// Clone the current config and its serial under the reader lock.
    pub fn snapshot(&self) -> (StimConfig, u64) {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        (guard.config.clone(), guard.serial)
    }

    /// Current serial without cloning the config.
    pub fn serial(&self) -> u64 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).serial
    }

    /// Run `f` against the live config under the reader lock.
    pub fn read<R>(&self, f: impl FnOnce(&StimConfig) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard.config)
    }

    /// Install a new config, bump the serial, and return the new serial.
    pub fn install(&self, config: StimConfig) -> u64 {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.config = config;
        guard.serial += 1;
        guard.serial
    }
}
