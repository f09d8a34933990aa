mod config;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uvckit_core::format::{interval_to_fps, FourCc};
use uvckit_core::value::parse_hex;
use uvckit_core::{
    AutoExposureMode, CameraControl, ClosestFormat, Control, ControlRange, ControlValue, FormatDescriptor,
    FormatRequest, FrameIntervals, PixelEncoding, PowerLineFrequency, ProcessingControl,
    ValueLayout,
};
use uvckit_hw::preset::lookup_builtin;
use uvckit_hw::{DeviceCandidate, DeviceRegistry, DeviceSession, Preset, RusbTransport};

#[derive(Parser)]
#[command(name = "uvc-util", version, about = "Inspect and adjust UVC camera controls")]
struct Cli {
    /// Camera to use: list index, VID:PID in hex, or BUS.ADDRESS
    #[arg(short, long, global = true)]
    device: Option<DeviceSelector>,
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    /// Control transfer timeout in milliseconds (overrides UVC_UTIL_TIMEOUT_MS)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached UVC cameras
    List,
    /// Show every control the camera advertises
    Controls,
    /// Read a control's current value
    Get {
        /// Control name (e.g. "brightness", "xu:4:1")
        control: Control,
    },
    /// Write a control
    Set {
        control: Control,
        /// Integer, "a,b" pair, hex payload, a named mode ("manual", "50hz"),
        /// "default", "minimum", "maximum", or a fraction of the range ("0.5")
        value: String,
    },
    /// Restore a control to its device default
    Reset { control: Control },
    /// Show a control's bounds
    Range { control: Control },
    /// List streaming formats
    Formats,
    /// Pick a streaming format and optionally run probe/commit
    Negotiate {
        #[arg(long)]
        width: u16,
        #[arg(long)]
        height: u16,
        #[arg(long)]
        fps: Option<u32>,
        /// Pixel encoding ("yuyv", "mjpeg", ... or a FourCC)
        #[arg(long)]
        encoding: Option<String>,
        /// Smallest acceptable width (overrides UVC_UTIL_MIN_WIDTH)
        #[arg(long)]
        min_width: Option<u16>,
        /// Smallest acceptable height (overrides UVC_UTIL_MIN_HEIGHT)
        #[arg(long)]
        min_height: Option<u16>,
        /// Commit the format and select the streaming alternate setting
        #[arg(long)]
        start: bool,
    },
    /// Save all settable controls to a preset file
    Save { path: PathBuf },
    /// Apply a preset file, or the built-in preset for this camera
    Load { path: Option<PathBuf> },
}

/// How `--device` picks a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DeviceSelector {
    Index(usize),
    Model { vendor_id: u16, product_id: u16 },
    Location { bus: u8, address: u8 },
}

impl FromStr for DeviceSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("invalid device {s:?}: expected INDEX, VID:PID or BUS.ADDRESS");
        if let Some((vid, pid)) = s.split_once(':') {
            return Ok(DeviceSelector::Model {
                vendor_id: u16::from_str_radix(vid, 16).map_err(|_| bad())?,
                product_id: u16::from_str_radix(pid, 16).map_err(|_| bad())?,
            });
        }
        if let Some((bus, address)) = s.split_once('.') {
            return Ok(DeviceSelector::Location {
                bus: bus.parse().map_err(|_| bad())?,
                address: address.parse().map_err(|_| bad())?,
            });
        }
        s.parse().map(DeviceSelector::Index).map_err(|_| bad())
    }
}

impl DeviceSelector {
    fn matches<D>(&self, index: usize, candidate: &DeviceCandidate<D>) -> bool {
        match *self {
            DeviceSelector::Index(i) => i == index,
            DeviceSelector::Model {
                vendor_id,
                product_id,
            } => candidate.vendor_id == vendor_id && candidate.product_id == product_id,
            DeviceSelector::Location { bus, address } => {
                candidate.id.bus == bus && candidate.id.address == address
            }
        }
    }
}

fn select<'a, D>(
    devices: &'a [DeviceCandidate<D>],
    selector: Option<&DeviceSelector>,
) -> Result<&'a DeviceCandidate<D>> {
    let Some(selector) = selector else {
        return devices.first().ok_or_else(|| anyhow!("no UVC camera found"));
    };
    devices
        .iter()
        .enumerate()
        .find(|(i, c)| selector.matches(*i, c))
        .map(|(_, c)| c)
        .ok_or_else(|| anyhow!("no UVC camera matches {selector:?}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(ms) = cli.timeout_ms {
        config.timeout = Duration::from_millis(ms);
    }
    tracing::debug!(?config, "configuration loaded");

    let transport = RusbTransport::new(config.timeout).context("failed to initialize libusb")?;
    let registry = DeviceRegistry::init(transport);
    let result = run(&cli, &config, &registry);
    registry.teardown();
    result
}

fn run(cli: &Cli, config: &Config, registry: &DeviceRegistry<RusbTransport>) -> Result<()> {
    let devices = registry.devices().context("failed to enumerate USB devices")?;
    if let Commands::List = cli.command {
        return list(&devices, cli.json);
    }

    let candidate = select(&devices, cli.device.as_ref())?;
    let session = registry
        .open(candidate)
        .with_context(|| format!("failed to open camera {}", candidate.id))?;

    let result = match &cli.command {
        Commands::List => Ok(()),
        Commands::Controls => controls(&session, cli.json),
        Commands::Get { control } => {
            let value = session.get(*control)?;
            print_value(*control, &value, cli.json)
        }
        Commands::Set { control, value } if value.trim().eq_ignore_ascii_case("default") => {
            reset(&session, *control, cli.json)
        }
        Commands::Set { control, value } => {
            let range = if wants_range(value) {
                Some(
                    session
                        .range(*control)
                        .with_context(|| format!("failed to read the range of {control}"))?,
                )
            } else {
                None
            };
            let value = parse_value(*control, value, range.as_ref())?;
            session
                .set(*control, &value)
                .with_context(|| format!("failed to set {control}"))?;
            if !cli.json {
                println!("{control} = {value}");
            }
            Ok(())
        }
        Commands::Reset { control } => reset(&session, *control, cli.json),
        Commands::Range { control } => range(&session, *control, cli.json),
        Commands::Formats => formats(session.formats(), cli.json),
        Commands::Negotiate {
            width,
            height,
            fps,
            encoding,
            min_width,
            min_height,
            start,
        } => {
            let negotiator = ClosestFormat {
                min_width: min_width.unwrap_or(config.min_width),
                min_height: min_height.unwrap_or(config.min_height),
            };
            let mut request = FormatRequest::new(*width, *height);
            if let Some(fps) = fps {
                request = request.with_fps(*fps);
            }
            if let Some(encoding) = encoding {
                request = request.with_encoding(parse_encoding(encoding)?);
            }
            negotiate(&session, &negotiator, &request, *start, cli.json)
        }
        Commands::Save { path } => {
            let preset = Preset::capture(&session);
            preset
                .save(path)
                .with_context(|| format!("failed to save {}", path.display()))?;
            println!("Saved {} controls to {}", preset.controls.len(), path.display());
            Ok(())
        }
        Commands::Load { path } => {
            let preset = match path {
                Some(path) => Preset::load(path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => lookup_builtin(session.vendor_id(), session.product_id())
                    .cloned()
                    .ok_or_else(|| {
                        anyhow!(
                            "no built-in preset for {:04x}:{:04x}",
                            session.vendor_id(),
                            session.product_id()
                        )
                    })?,
            };
            let applied = preset.apply(&session)?;
            println!("Applied {applied} controls");
            Ok(())
        }
    };

    session.close();
    result
}

#[derive(Serialize)]
struct DeviceRow {
    index: usize,
    bus: u8,
    address: u8,
    vendor_id: String,
    product_id: String,
    name: Option<String>,
}

fn list<D>(devices: &[DeviceCandidate<D>], json: bool) -> Result<()> {
    let rows: Vec<DeviceRow> = devices
        .iter()
        .enumerate()
        .map(|(index, c)| DeviceRow {
            index,
            bus: c.id.bus,
            address: c.id.address,
            vendor_id: format!("{:04x}", c.vendor_id),
            product_id: format!("{:04x}", c.product_id),
            name: c.name.clone(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No UVC cameras found");
    }
    for row in &rows {
        println!(
            "[{}] {:03}.{:03}  {}:{}  {}",
            row.index,
            row.bus,
            row.address,
            row.vendor_id,
            row.product_id,
            row.name.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct ControlRow {
    name: String,
    unit: u8,
    selector: u8,
    length: Option<u16>,
    caps: Vec<String>,
    current: Option<serde_json::Value>,
    min: Option<serde_json::Value>,
    max: Option<serde_json::Value>,
}

fn controls(session: &DeviceSession<'_, RusbTransport>, json: bool) -> Result<()> {
    let mut rows = Vec::new();
    for desc in session.controls() {
        let caps = session.info(desc.control).unwrap_or(desc.caps);
        let current = session.get(desc.control).ok();
        let range = if desc.layout.has_range() {
            session.range(desc.control).ok()
        } else {
            None
        };
        rows.push(ControlRow {
            name: desc.control.to_string(),
            unit: desc.unit_id,
            selector: desc.control.selector(),
            length: desc.length,
            caps: caps.iter_names().map(|(n, _)| n.to_lowercase()).collect(),
            current: current.as_ref().map(value_json),
            min: range.as_ref().map(|r| value_json(&r.min)),
            max: range.as_ref().map(|r| value_json(&r.max)),
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for row in &rows {
        let current = row.current.as_ref().map_or("?".to_string(), |v| v.to_string());
        let bounds = match (&row.min, &row.max) {
            (Some(min), Some(max)) => format!("  [{min} .. {max}]"),
            _ => String::new(),
        };
        println!(
            "{:<34} unit {:>2}  {:<5}  {}{}",
            row.name,
            row.unit,
            row.caps.join(","),
            current,
            bounds
        );
    }
    Ok(())
}

fn range(session: &DeviceSession<'_, RusbTransport>, control: Control, json: bool) -> Result<()> {
    let range = session.range(control)?;
    if json {
        let out = serde_json::json!({
            "control": control.to_string(),
            "min": value_json(&range.min),
            "max": value_json(&range.max),
            "res": value_json(&range.res),
            "def": value_json(&range.def),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{control}");
        println!("  min: {}", range.min);
        println!("  max: {}", range.max);
        println!("  res: {}", range.res);
        println!("  def: {}", range.def);
    }
    Ok(())
}

fn reset(session: &DeviceSession<'_, RusbTransport>, control: Control, json: bool) -> Result<()> {
    let value = session
        .reset_to_default(control)
        .with_context(|| format!("failed to reset {control}"))?;
    print_value(control, &value, json)
}

fn print_value(control: Control, value: &ControlValue, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "control": control.to_string(),
            "value": value_json(value),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    match (control, value.as_int()) {
        (Control::Camera(CameraControl::AutoExposureMode), Some(bits)) => {
            match u8::try_from(bits).ok().and_then(AutoExposureMode::from_bits) {
                Some(mode) => {
                    let name: &'static str = mode.into();
                    println!("{control} = {value} ({name})");
                }
                None => println!("{control} = {value}"),
            }
        }
        (Control::Processing(ProcessingControl::PowerLineFrequency), Some(v)) => {
            match u8::try_from(v).ok().and_then(PowerLineFrequency::from_value) {
                Some(mode) => {
                    let name: &'static str = mode.into();
                    println!("{control} = {value} ({name})");
                }
                None => println!("{control} = {value}"),
            }
        }
        _ => println!("{control} = {value}"),
    }
    Ok(())
}

#[derive(Serialize)]
struct FormatRow {
    interface: u8,
    format_index: u8,
    frame_index: u8,
    encoding: String,
    width: u16,
    height: u16,
    default_fps: f64,
    fps: Vec<f64>,
}

fn frame_rates(intervals: &FrameIntervals) -> Vec<f64> {
    match intervals {
        FrameIntervals::Discrete(list) => list.iter().map(|i| interval_to_fps(*i)).collect(),
        FrameIntervals::Continuous { min, max, .. } => {
            vec![interval_to_fps(*min), interval_to_fps(*max)]
        }
    }
}

fn formats(formats: &[FormatDescriptor], json: bool) -> Result<()> {
    let rows: Vec<FormatRow> = formats
        .iter()
        .map(|f| FormatRow {
            interface: f.interface,
            format_index: f.format_index,
            frame_index: f.frame_index,
            encoding: f.encoding.to_string(),
            width: f.width,
            height: f.height,
            default_fps: interval_to_fps(f.default_interval),
            fps: frame_rates(&f.intervals),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for row in &rows {
        let rates: Vec<String> = row.fps.iter().map(|r| format!("{r:.1}")).collect();
        println!(
            "if{} fmt{} frm{}  {:<6} {}x{}  fps {}",
            row.interface,
            row.format_index,
            row.frame_index,
            row.encoding,
            row.width,
            row.height,
            rates.join("/")
        );
    }
    Ok(())
}

fn negotiate(
    session: &DeviceSession<'_, RusbTransport>,
    negotiator: &ClosestFormat,
    request: &FormatRequest,
    start: bool,
    json: bool,
) -> Result<()> {
    let negotiated = session.negotiate(negotiator, request)?;
    let committed = if start {
        let committed = session
            .start_stream(&negotiated.format, negotiated.interval)
            .context("probe/commit failed")?;
        session.stop_stream()?;
        Some(committed)
    } else {
        None
    };

    if json {
        let out = serde_json::json!({
            "format": negotiated.format.to_string(),
            "interface": negotiated.format.interface,
            "width": negotiated.format.width,
            "height": negotiated.format.height,
            "fps": interval_to_fps(negotiated.interval),
            "max_video_frame_size": committed.as_ref().map(|c| c.max_video_frame_size),
            "max_payload_transfer_size": committed.as_ref().map(|c| c.max_payload_transfer_size),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    println!(
        "{} @ {:.1} fps",
        negotiated.format,
        interval_to_fps(negotiated.interval)
    );
    if let Some(c) = committed {
        println!(
            "committed: frame {} bytes, payload {} bytes per interval",
            c.max_video_frame_size, c.max_payload_transfer_size
        );
    }
    Ok(())
}

fn value_json(value: &ControlValue) -> serde_json::Value {
    match value {
        ControlValue::Int(v) => serde_json::json!(v),
        ControlValue::Pair(a, b) => serde_json::json!([a, b]),
        ControlValue::Raw(_) => serde_json::json!(value.to_string()),
    }
}

/// Bounds of one value component, as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    min: i64,
    max: i64,
    res: i64,
    def: i64,
}

impl Bounds {
    fn scalar(range: &ControlRange) -> Option<Self> {
        Some(Self {
            min: range.min.as_int()?,
            max: range.max.as_int()?,
            res: range.res.as_int()?,
            def: range.def.as_int()?,
        })
    }

    fn pair(range: &ControlRange) -> Option<(Self, Self)> {
        let (min, max) = (range.min.as_pair()?, range.max.as_pair()?);
        let (res, def) = (range.res.as_pair()?, range.def.as_pair()?);
        Some((
            Self {
                min: min.0,
                max: max.0,
                res: res.0,
                def: def.0,
            },
            Self {
                min: min.1,
                max: max.1,
                res: res.1,
                def: def.1,
            },
        ))
    }

    /// `min + fraction * (max - min)`, snapped down to a whole step above `min`.
    fn at_fraction(&self, fraction: f64) -> i64 {
        let offset = (fraction * (self.max - self.min) as f64).round() as i64;
        let step = self.res.max(1);
        self.min + offset / step * step
    }
}

fn is_relative(component: &str) -> bool {
    let component = component.trim().to_ascii_lowercase();
    matches!(
        component.as_str(),
        "default" | "def" | "minimum" | "min" | "maximum" | "max"
    ) || component.contains('.')
}

/// Whether a value names a bound or a fraction, so the range must be read first.
fn wants_range(text: &str) -> bool {
    text.split(',').any(is_relative)
}

/// One integer component: a literal, a bound keyword, or a fraction in `0.0..=1.0`.
fn parse_component(text: &str, bounds: Option<Bounds>) -> Result<i64> {
    let text = text.trim();
    let need = || bounds.ok_or_else(|| anyhow!("{text:?} needs the control's range"));
    match text.to_ascii_lowercase().as_str() {
        "default" | "def" => return Ok(need()?.def),
        "minimum" | "min" => return Ok(need()?.min),
        "maximum" | "max" => return Ok(need()?.max),
        _ => {}
    }
    if text.contains('.') {
        let fraction: f64 = text
            .parse()
            .with_context(|| format!("{text:?} is not a fraction"))?;
        if !(0.0..=1.0).contains(&fraction) {
            bail!("fraction {text} is outside 0.0 ..= 1.0");
        }
        return Ok(need()?.at_fraction(fraction));
    }
    parse_int(text)
}

/// Parse a command-line value according to the control's layout.
///
/// `range` resolves keywords and fractions. A keyword or fraction given
/// once for a pair applies to both components.
fn parse_value(control: Control, text: &str, range: Option<&ControlRange>) -> Result<ControlValue> {
    let text = text.trim();
    match control {
        Control::Camera(CameraControl::AutoExposureMode) => {
            if let Ok(mode) = AutoExposureMode::from_str(text) {
                return Ok(ControlValue::Int(mode.bits() as i64));
            }
        }
        Control::Processing(ProcessingControl::PowerLineFrequency) => {
            if let Ok(mode) = PowerLineFrequency::from_str(text) {
                return Ok(ControlValue::Int(mode.value() as i64));
            }
        }
        _ => {}
    }

    match control.layout() {
        ValueLayout::Raw => parse_hex(text)
            .map(ControlValue::Raw)
            .ok_or_else(|| anyhow!("{text:?} is not a hex payload")),
        ValueLayout::SignedPair(_) | ValueLayout::UnsignedPair(_) => {
            let (a, b) = match text.split_once(',') {
                Some(parts) => parts,
                None if is_relative(text) => (text, text),
                None => bail!("{control} takes two values, e.g. \"0,3600\""),
            };
            let bounds = range.and_then(Bounds::pair);
            Ok(ControlValue::Pair(
                parse_component(a, bounds.map(|b| b.0))?,
                parse_component(b, bounds.map(|b| b.1))?,
            ))
        }
        ValueLayout::Boolean => match text {
            "on" | "true" | "1" => Ok(ControlValue::Int(1)),
            "off" | "false" | "0" => Ok(ControlValue::Int(0)),
            _ => bail!("{control} takes on/off"),
        },
        ValueLayout::Bitmap(_) => Ok(ControlValue::Int(parse_int(text)?)),
        ValueLayout::Signed(_) | ValueLayout::Unsigned(_) => Ok(ControlValue::Int(
            parse_component(text, range.and_then(Bounds::scalar))?,
        )),
    }
}

fn parse_int(text: &str) -> Result<i64> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("{text:?} is not an integer"))
}

fn parse_encoding(text: &str) -> Result<PixelEncoding> {
    let encoding = match text.to_ascii_lowercase().as_str() {
        "yuyv" | "yuy2" => PixelEncoding::Yuyv,
        "nv12" => PixelEncoding::Nv12,
        "grey" | "gray" | "y800" => PixelEncoding::Grey,
        "y16" => PixelEncoding::Y16,
        "mjpeg" | "mjpg" => PixelEncoding::Mjpeg,
        "h264" => PixelEncoding::H264,
        _ => {
            let code: [u8; 4] = text
                .as_bytes()
                .try_into()
                .map_err(|_| anyhow!("unknown encoding {text:?}"))?;
            PixelEncoding::from_fourcc(FourCc(code))
        }
    };
    Ok(encoding)
}
