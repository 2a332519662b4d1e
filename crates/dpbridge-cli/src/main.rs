//! Command-line tools for inspecting DataPoint traffic and device profiles.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use dpbridge_core::config::clusters;
use dpbridge_devices::codec::{self, DataPointFrame, DecodeReport, DpType, DpValue};
use dpbridge_devices::{profiles, Classifier, DeviceIdentity, EngineConfig, Envelope};
use serde::Serialize;

/// DataPoint bridge tooling.
#[derive(Parser, Debug)]
#[command(name = "dpbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Engine configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a hex-encoded DataPoint buffer.
    Decode {
        /// Payload bytes as hex.
        hex: String,
        /// The payload starts with a two-byte sequence number.
        #[arg(long)]
        envelope: bool,
        /// Fail when any frame is malformed.
        #[arg(long)]
        strict: bool,
    },
    /// Encode a single DataPoint.
    Encode {
        /// DataPoint id.
        #[arg(long)]
        id: u8,
        /// Type: raw, bool, value, string, enum or bitmap.
        #[arg(long = "type")]
        ty: DpType,
        /// Value; hex for raw payloads.
        #[arg(long, allow_hyphen_values = true)]
        value: String,
        /// Wrap in an envelope with this sequence number.
        #[arg(long)]
        seq: Option<u16>,
    },
    /// Classify a device from its interview data.
    Classify {
        /// Manufacturer string.
        #[arg(long)]
        vendor: String,
        /// Model identifier.
        #[arg(long)]
        model: String,
        /// Cluster on endpoint 1, by name or id. Repeatable.
        #[arg(long = "cluster")]
        clusters: Vec<String>,
        /// Overlay traffic was already seen for this device.
        #[arg(long)]
        proprietary: bool,
    },
    /// List built-in profiles, or show one.
    Profiles {
        /// Profile name.
        name: Option<String>,
    },
    /// Print the effective engine configuration.
    Config,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if args.verbose { "debug" } else { "info" };
        tracing_subscriber::EnvFilter::new(format!("dpbridge={level}"))
            .add_directive(tracing::Level::WARN.into())
    });
    let json_logging = std::env::var("DPBRIDGE_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .init();
    }

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Decode {
            hex,
            envelope,
            strict,
        } => run_decode(&hex, envelope, strict, args.json),
        Command::Encode { id, ty, value, seq } => run_encode(id, ty, &value, seq, args.json),
        Command::Classify {
            vendor,
            model,
            clusters,
            proprietary,
        } => run_classify(&config, vendor, model, &clusters, proprietary, args.json),
        Command::Profiles { name } => run_profiles(name.as_deref(), args.json),
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            tracing::debug!("Loading config from {}", path.display());
            Ok(EngineConfig::load(path)?)
        }
        None => Ok(EngineConfig::from_env()),
    }
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&cleaned).with_context(|| format!("invalid hex payload '{}'", input))
}

#[derive(Serialize)]
struct DecodeOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    seq: Option<u16>,
    frames: Vec<DataPointFrame>,
    errors: Vec<String>,
}

fn run_decode(input: &str, envelope: bool, strict: bool, json: bool) -> Result<()> {
    let bytes = parse_hex(input)?;
    let (seq, report) = if envelope {
        let (seq, report) = Envelope::decode(&bytes)?;
        (Some(seq), report)
    } else {
        (None, codec::decode(&bytes))
    };
    let DecodeReport { frames, errors } = report;

    if json {
        let output = DecodeOutput {
            seq,
            frames,
            errors: errors.iter().map(|e| e.to_string()).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        if let Some(seq) = seq {
            println!("seq {}", seq);
        }
        for frame in &frames {
            println!("dp {:>3}  {:<7} {}", frame.id, type_name(frame.dp_type()), describe(&frame.value));
        }
        for error in &errors {
            println!("error: {}", error);
        }
    }

    if strict {
        if let Some(first) = errors.first() {
            bail!("{}", first);
        }
    }
    Ok(())
}

fn type_name(ty: DpType) -> &'static str {
    match ty {
        DpType::Raw => "raw",
        DpType::Bool => "bool",
        DpType::Value => "value",
        DpType::String => "string",
        DpType::Enum => "enum",
        DpType::Bitmap => "bitmap",
    }
}

fn describe(value: &DpValue) -> String {
    match value {
        DpValue::Raw(bytes) => hex::encode(bytes),
        DpValue::Bool(b) => b.to_string(),
        DpValue::Value(v) => v.to_string(),
        DpValue::String(bytes) => format!("{:?}", String::from_utf8_lossy(bytes)),
        DpValue::Enum(e) => e.to_string(),
        DpValue::Bitmap(bits) => format!("0x{:X}", bits),
    }
}

fn parse_unsigned(input: &str) -> Result<u64> {
    let input = input.trim();
    let parsed = match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => input.parse::<u64>(),
    };
    parsed.with_context(|| format!("invalid number '{}'", input))
}

fn parse_value(ty: DpType, input: &str) -> Result<DpValue> {
    let value = match ty {
        DpType::Raw => DpValue::Raw(parse_hex(input)?),
        DpType::Bool => match input.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" => DpValue::Bool(true),
            "false" | "0" | "off" => DpValue::Bool(false),
            other => bail!("invalid bool '{}'", other),
        },
        DpType::Value => DpValue::Value(
            input
                .trim()
                .parse::<i32>()
                .with_context(|| format!("invalid 32-bit value '{}'", input))?,
        ),
        DpType::String => DpValue::String(input.as_bytes().to_vec()),
        DpType::Enum => DpValue::Enum(
            u8::try_from(parse_unsigned(input)?).map_err(|_| anyhow!("enum '{}' exceeds 255", input))?,
        ),
        DpType::Bitmap => DpValue::Bitmap(
            u32::try_from(parse_unsigned(input)?)
                .map_err(|_| anyhow!("bitmap '{}' exceeds 32 bits", input))?,
        ),
    };
    Ok(value)
}

fn run_encode(id: u8, ty: DpType, input: &str, seq: Option<u16>, json: bool) -> Result<()> {
    let value = parse_value(ty, input)?;
    let bytes = match seq {
        Some(seq) => Envelope::new(seq, vec![DataPointFrame::new(id, value)]).encode()?,
        None => codec::encode(id, &value)?,
    };
    let encoded = hex::encode(&bytes);
    if json {
        println!("{}", serde_json::json!({ "hex": encoded, "len": bytes.len() }));
    } else {
        println!("{}", encoded);
    }
    Ok(())
}

fn run_classify(
    config: &EngineConfig,
    vendor: String,
    model: String,
    names: &[String],
    proprietary: bool,
    json: bool,
) -> Result<()> {
    let mut builder = DeviceIdentity::builder(vendor, model).endpoint(1);
    for name in names {
        let id = clusters::resolve(name).ok_or_else(|| anyhow!("unknown cluster '{}'", name))?;
        builder = builder.cluster(1, id);
    }
    let identity = builder.build();

    let decision = Classifier::new(config.classifier.clone()).classify_with_session(&identity, proprietary);
    if json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else {
        println!("protocol:  {}", decision.protocol);
        println!("rule:      {:?}", decision.rule);
        println!("passive:   {}", decision.passive);
        println!("ambiguous: {}", decision.ambiguous);
    }
    Ok(())
}

fn run_profiles(name: Option<&str>, json: bool) -> Result<()> {
    let Some(name) = name else {
        let names = profiles::builtin_names();
        if json {
            println!("{}", serde_json::to_string(&names)?);
        } else {
            for name in names {
                println!("{}", name);
            }
        }
        return Ok(());
    };

    let profile = profiles::builtin(name).ok_or_else(|| anyhow!("no built-in profile '{}'", name))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        println!("{} ({:?}, {:?} trust)", profile.name, profile.role, profile.trust);
        for binding in &profile.bindings {
            println!("  {:<28} <- {}", binding.capability, binding.key);
        }
    }
    Ok(())
}
