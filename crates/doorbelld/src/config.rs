use anyhow::Context;
use doorbell_core::{WorkerConfig, DEFAULT_TOLERANCE};
use doorbell_hw::PinMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/doorbell/doorbell.toml";

/// Which message bus the admin interface is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl BusKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "system" => Some(BusKind::System),
            "session" => Some(BusKind::Session),
            _ => None,
        }
    }
}

/// `[gpio]` table; BCM numbering.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GpioFile {
    led_red: Option<u32>,
    led_yellow: Option<u32>,
    led_green: Option<u32>,
    bell_button: Option<u32>,
    door_switch: Option<u32>,
}

/// Shape of the TOML file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    face_store: Option<PathBuf>,
    match_tolerance: Option<f32>,
    analyzer_command: Option<Vec<String>>,
    analyzer_timeout_ms: Option<u64>,
    snapshot_path: Option<PathBuf>,
    snapshot_interval_ms: Option<u64>,
    frame_width: Option<u32>,
    warmup_frames: Option<usize>,
    gpio_base: Option<u32>,
    #[serde(default)]
    gpio: GpioFile,
    dbus_bus: Option<BusKind>,
}

/// Daemon configuration: defaults, then the TOML file, then `DOORBELL_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Known-face store file.
    pub face_store: PathBuf,
    /// Euclidean distance at or below which two embeddings match.
    pub match_tolerance: f32,
    /// Face analyzer helper program followed by its arguments.
    pub analyzer_command: Vec<String>,
    /// Time the helper gets to take one frame and answer it.
    pub analyzer_timeout_ms: u64,
    /// Where the latest annotated frame is written, if anywhere.
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval_ms: u64,
    /// Requested capture width; height follows at 4:3.
    pub frame_width: u32,
    /// Frames discarded at startup while exposure settles.
    pub warmup_frames: usize,
    pub pins: PinMap,
    pub dbus_bus: BusKind,
    /// File the configuration was read from, if one existed.
    pub source: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            face_store: doorbell_core::default_store_path(),
            match_tolerance: DEFAULT_TOLERANCE,
            analyzer_command: vec!["doorbell-analyzer".to_string()],
            analyzer_timeout_ms: 2000,
            snapshot_path: None,
            snapshot_interval_ms: 500,
            frame_width: 420,
            warmup_frames: 4,
            pins: PinMap::default(),
            dbus_bus: BusKind::System,
            source: None,
        }
    }
}

impl Config {
    /// Load from `DOORBELL_CONFIG` (or the default path) and the process
    /// environment.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("DOORBELL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path, |key| std::env::var(key).ok())
    }

    /// Layer `path` (if it exists) and the variables returned by `env` over
    /// the defaults.
    pub fn load_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let file: FileConfig = toml::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            config.apply_file(file);
            config.source = Some(path.to_path_buf());
        }

        config.apply_env(&env);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = file.face_store {
            self.face_store = v;
        }
        if let Some(v) = file.match_tolerance {
            self.match_tolerance = v;
        }
        if let Some(v) = file.analyzer_command {
            self.analyzer_command = v;
        }
        if let Some(v) = file.analyzer_timeout_ms {
            self.analyzer_timeout_ms = v;
        }
        if file.snapshot_path.is_some() {
            self.snapshot_path = file.snapshot_path;
        }
        if let Some(v) = file.snapshot_interval_ms {
            self.snapshot_interval_ms = v;
        }
        if let Some(v) = file.frame_width {
            self.frame_width = v;
        }
        if let Some(v) = file.warmup_frames {
            self.warmup_frames = v;
        }
        if let Some(v) = file.gpio_base {
            self.pins.base = v;
        }
        let gpio = file.gpio;
        self.pins.led_red = gpio.led_red.unwrap_or(self.pins.led_red);
        self.pins.led_yellow = gpio.led_yellow.unwrap_or(self.pins.led_yellow);
        self.pins.led_green = gpio.led_green.unwrap_or(self.pins.led_green);
        self.pins.bell_button = gpio.bell_button.unwrap_or(self.pins.bell_button);
        self.pins.door_switch = gpio.door_switch.unwrap_or(self.pins.door_switch);
        if let Some(v) = file.dbus_bus {
            self.dbus_bus = v;
        }
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("DOORBELL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = env("DOORBELL_FACE_STORE") {
            self.face_store = PathBuf::from(v);
        }
        if let Some(v) = env("DOORBELL_ANALYZER_COMMAND") {
            let parts: Vec<String> = v.split_whitespace().map(str::to_string).collect();
            if !parts.is_empty() {
                self.analyzer_command = parts;
            }
        }
        if let Some(v) = env("DOORBELL_SNAPSHOT_PATH") {
            self.snapshot_path = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        if let Some(v) = env("DOORBELL_DBUS_BUS").as_deref().and_then(BusKind::parse) {
            self.dbus_bus = v;
        }
        self.match_tolerance = env_parse(env, "DOORBELL_MATCH_TOLERANCE", self.match_tolerance);
        self.analyzer_timeout_ms =
            env_parse(env, "DOORBELL_ANALYZER_TIMEOUT_MS", self.analyzer_timeout_ms);
        self.snapshot_interval_ms =
            env_parse(env, "DOORBELL_SNAPSHOT_INTERVAL_MS", self.snapshot_interval_ms);
        self.frame_width = env_parse(env, "DOORBELL_FRAME_WIDTH", self.frame_width);
        self.warmup_frames = env_parse(env, "DOORBELL_WARMUP_FRAMES", self.warmup_frames);
        self.pins.base = env_parse(env, "DOORBELL_GPIO_BASE", self.pins.base);
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(self.match_tolerance.is_finite() && self.match_tolerance > 0.0) {
            anyhow::bail!("match_tolerance must be a positive number, got {}", self.match_tolerance);
        }
        if self.analyzer_command.is_empty() {
            anyhow::bail!("analyzer_command must name a program");
        }
        if self.analyzer_timeout_ms == 0 {
            anyhow::bail!("analyzer_timeout_ms must be non-zero");
        }
        if self.frame_width == 0 {
            anyhow::bail!("frame_width must be non-zero");
        }
        Ok(())
    }

    /// Requested capture height, keeping a 4:3 aspect ratio.
    pub fn frame_height(&self) -> u32 {
        self.frame_width * 3 / 4
    }

    pub fn analyzer_timeout(&self) -> Duration {
        Duration::from_millis(self.analyzer_timeout_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            tolerance: self.match_tolerance,
            ..WorkerConfig::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
