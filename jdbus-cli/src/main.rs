use bytes::Bytes;
use clap::{Parser, Subcommand};
use jdbus_lib::bus::Bus;
use jdbus_lib::device::{Announce, DeviceChange};
use jdbus_lib::dispatch::{CommandKind, Dispatch, EventNotification, SystemCommand};
use jdbus_lib::frame::Frame;
use jdbus_lib::pack::{PayloadFormat, Value};
use jdbus_lib::pipe::PipeCommand;
use jdbus_lib::registry::{Registry, ServiceEntry};
use std::error::Error;
use std::fmt::Write as FmtWrite;
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Instant;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect and replay jdbus device-bus traffic")]
struct Args {
    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode one hex-encoded frame and describe it
    Decode {
        /// Raw frame bytes as hex (whitespace allowed)
        hex: String,
    },
    /// Unpack hex payload bytes using a format string
    Unpack {
        /// Format string, e.g. "u16 i8.8 s"
        format: String,
        /// Payload bytes as hex
        hex: String,
    },
    /// Pack a JSON array of values into payload bytes
    Pack {
        /// Format string, e.g. "u16 i8.8 s"
        format: String,
        /// Values as a JSON array, e.g. '[1, -2.5, "on"]'
        values: String,
    },
    /// List services known to the built-in registry
    Services {
        /// Restrict output to one service, by name or class
        service: Option<String>,
    },
    /// Replay a capture (one hex frame per line) through a bus
    Monitor {
        /// Capture file; reads stdin when omitted
        file: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    match args.command {
        Command::Decode { hex } => {
            let registry = Registry::core()?;
            let frame = Frame::decode(&decode_hex_arg(&hex)?)?;
            print!("{}", render_frame(&frame, &registry));
        }
        Command::Unpack { format, hex } => {
            println!("{}", unpack_json(&format, &hex)?);
        }
        Command::Pack { format, values } => {
            println!("{}", pack_hex(&format, &values)?);
        }
        Command::Services { service } => {
            print_services(service.as_deref())?;
        }
        Command::Monitor { file } => {
            monitor(file)?;
        }
    }
    Ok(())
}

/// Strip whitespace and decode a hex argument.
fn decode_hex_arg(text: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    let compact: String = text.split_whitespace().collect();
    Ok(hex::decode(compact)?)
}

fn unpack_json(format: &str, hex: &str) -> Result<serde_json::Value, Box<dyn Error>> {
    let format: PayloadFormat = format.parse()?;
    let data = decode_hex_arg(hex)?;
    Ok(values_to_json(&format.unpack(&data)))
}

fn pack_hex(format: &str, values: &str) -> Result<String, Box<dyn Error>> {
    let format: PayloadFormat = format.parse()?;
    let json: serde_json::Value = serde_json::from_str(values)?;
    let serde_json::Value::Array(items) = json else {
        return Err("values must be a JSON array".into());
    };
    let values = items
        .iter()
        .map(json_to_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(hex::encode(format.pack(&values)?))
}

/// Unpacked values as JSON: numbers and strings map directly, blobs become
/// `{"hex": ".."}` objects, a records section becomes an array of arrays.
fn values_to_json(values: &[Value]) -> serde_json::Value {
    serde_json::Value::Array(values.iter().map(value_to_json).collect())
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Unsigned(v) => serde_json::Value::from(*v),
        Value::Signed(v) => serde_json::Value::from(*v),
        Value::Float(v) => serde_json::Value::from(*v),
        Value::Bytes(data) => serde_json::json!({ "hex": hex::encode(data) }),
        Value::String(s) => serde_json::Value::from(s.as_str()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Records(rows) => serde_json::Value::Array(
            rows.iter()
                .map(|row| serde_json::Value::Array(row.iter().map(value_to_json).collect()))
                .collect(),
        ),
    }
}

fn json_to_value(json: &serde_json::Value) -> Result<Value, Box<dyn Error>> {
    Ok(match json {
        serde_json::Value::Bool(b) => Value::Unsigned(*b as u64),
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                Value::Unsigned(v)
            } else if let Some(v) = n.as_i64() {
                Value::Signed(v)
            } else if let Some(v) = n.as_f64() {
                Value::Float(v)
            } else {
                return Err(format!("unrepresentable number {n}").into());
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Object(map) => match map.get("hex") {
            Some(serde_json::Value::String(h)) => Value::Bytes(Bytes::from(hex::decode(h)?)),
            _ => return Err(format!("expected a {{\"hex\": \"..\"}} object, got {json}").into()),
        },
        serde_json::Value::Array(items)
            if !items.is_empty() && items.iter().all(serde_json::Value::is_array) =>
        {
            let rows = items
                .iter()
                .filter_map(serde_json::Value::as_array)
                .map(|row| row.iter().map(json_to_value).collect::<Result<Vec<_>, _>>())
                .collect::<Result<Vec<_>, _>>()?;
            Value::Records(rows)
        }
        serde_json::Value::Array(items) => Value::Array(
            items
                .iter()
                .map(json_to_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        serde_json::Value::Null => return Err("null is not packable".into()),
    })
}

/// Pretty printer for a decoded frame.
fn render_frame(frame: &Frame, registry: &Registry) -> String {
    let mut out = String::new();
    match frame.multicast_class() {
        Some(class) => {
            let name = registry.service_name(class).unwrap_or("unknown");
            writeln!(&mut out, "multicast command class {class:#010x} ({name})").unwrap();
        }
        None => {
            let direction = if frame.is_command() { "command" } else { "report" };
            let ack = if frame.wants_ack() { ", ack requested" } else { "" };
            writeln!(
                &mut out,
                "{} device {:016x} service {}{}",
                direction, frame.device_id, frame.service_index, ack
            )
            .unwrap();
        }
    }
    writeln!(&mut out, "  {}", describe_command(frame)).unwrap();
    if frame.is_announce() {
        match Announce::from_payload(&frame.payload) {
            Ok(announce) => out.push_str(&render_announce(&announce, registry)),
            Err(e) => writeln!(&mut out, "  bad announce payload: {e}").unwrap(),
        }
    } else if !frame.payload.is_empty() {
        writeln!(
            &mut out,
            "  payload {} bytes: {}",
            frame.payload.len(),
            hex::encode(&frame.payload)
        )
        .unwrap();
    }
    out
}

fn describe_command(frame: &Frame) -> String {
    if frame.is_pipe() {
        let pipe = PipeCommand::from_command_word(frame.service_command);
        let mut desc = format!("pipe port {} counter {}", pipe.port(), pipe.counter());
        if pipe.metadata() {
            desc.push_str(" metadata");
        }
        if pipe.close() {
            desc.push_str(" close");
        }
        return desc;
    }
    match CommandKind::from(frame.service_command) {
        CommandKind::GetRegister(code) => format!("get register {code:#x}"),
        CommandKind::SetRegister(code) => format!("set register {code:#x}"),
        CommandKind::Action(code) => match SystemCommand::from(code) {
            SystemCommand::Announce if frame.is_report() => "announce".to_string(),
            SystemCommand::Event if frame.is_report() => "event".to_string(),
            SystemCommand::Calibrate if frame.is_command() => "calibrate".to_string(),
            _ => format!("action {code:#x}"),
        },
    }
}

fn render_announce(announce: &Announce, registry: &Registry) -> String {
    let mut out = String::new();
    writeln!(
        &mut out,
        "  restart {} packets {} flags {:#04x}",
        announce.restart_generation(),
        announce.packet_count,
        announce.flags
    )
    .unwrap();
    for (k, class) in announce.service_classes.iter().enumerate() {
        let name = registry.service_name(*class).unwrap_or("unknown");
        writeln!(&mut out, "  service {}: {:#010x} ({})", k + 1, class, name).unwrap();
    }
    out
}

fn print_services(filter: Option<&str>) -> Result<(), Box<dyn Error>> {
    let registry = Registry::core()?;
    let wanted = filter
        .map(|f| resolve_service_arg(&registry, f))
        .transpose()?;
    println!("registry {}", registry.version());
    if wanted.is_none() {
        print!("{}", render_service(None, registry.system()));
    }
    for (class, entry) in registry.services() {
        if wanted.is_some_and(|w| w != class) {
            continue;
        }
        print!("{}", render_service(Some(class), entry));
    }
    Ok(())
}

fn resolve_service_arg(registry: &Registry, arg: &str) -> Result<u32, Box<dyn Error>> {
    let parsed = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => arg.parse::<u32>().ok(),
    };
    if let Some(class) = parsed {
        return Ok(class);
    }
    registry
        .services()
        .find(|(_, entry)| entry.name == arg)
        .map(|(class, _)| class)
        .ok_or_else(|| format!("unknown service `{arg}`").into())
}

/// One service as an indented block of registers, commands and events.
fn render_service(class: Option<u32>, entry: &ServiceEntry) -> String {
    let mut out = String::new();
    match class {
        Some(class) => writeln!(&mut out, "\n{} ({:#010x})", entry.name, class).unwrap(),
        None => writeln!(&mut out, "\n{} (shared definitions)", entry.name).unwrap(),
    }
    for (code, reg) in &entry.registers {
        writeln!(
            &mut out,
            "  reg {:#06x} {} {} \"{}\"",
            code, reg.name, reg.access, reg.format
        )
        .unwrap();
    }
    for (code, cmd) in &entry.commands {
        let mut line = format!("  cmd {:#06x} {}", code, cmd.name);
        if let Some(request) = &cmd.request {
            write!(&mut line, " req \"{request}\"").unwrap();
        }
        if cmd.opens_pipe {
            line.push_str(" (pipe)");
        }
        if let Some(report) = &cmd.report {
            write!(&mut line, " rep \"{report}\"").unwrap();
        }
        writeln!(&mut out, "{line}").unwrap();
    }
    for (code, ev) in &entry.events {
        let mut line = format!("  evt {:#06x} {}", code, ev.name);
        if let Some(payload) = &ev.payload {
            write!(&mut line, " \"{payload}\"").unwrap();
        }
        writeln!(&mut out, "{line}").unwrap();
    }
    out
}

fn monitor(path: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let mut bus = Bus::with_core_registry()?;
    install_printers(&mut bus);

    let reader: Box<dyn BufRead> = match path {
        Some(path) => Box::new(std::io::BufReader::new(std::fs::File::open(path)?)),
        None => Box::new(std::io::BufReader::new(std::io::stdin())),
    };

    let epoch = Instant::now();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let now_ms = epoch.elapsed().as_millis() as u64;
        match decode_hex_arg(trimmed) {
            Ok(raw) => bus.process(&raw, now_ms),
            Err(e) => warn!("skipping line: {}", e),
        }
        bus.sweep(now_ms);
    }

    let stats = bus.stats();
    println!(
        "{} frames ({} dropped, {} crc errors), {} announces, {} commands, {} reports, {} events",
        stats.frames_processed,
        stats.frames_dropped,
        stats.crc_errors,
        stats.announces,
        stats.commands,
        stats.reports,
        stats.events
    );
    println!(
        "{} pipe frames ({} timed out), {} dispatch misses, {} devices expired",
        stats.pipe_frames, stats.pipe_timeouts, stats.dispatch_misses, stats.devices_expired
    );
    Ok(())
}

/// Wire print handlers for every service the registry knows about.
fn install_printers(bus: &mut Bus) {
    bus.set_device_observer(Box::new(|change| match change {
        DeviceChange::Connected { device_id } => println!("+ {device_id:016x} connected"),
        DeviceChange::Restarted { device_id } => println!("~ {device_id:016x} restarted"),
        DeviceChange::ServicesChanged { device_id } => {
            println!("~ {device_id:016x} services changed")
        }
        DeviceChange::Disconnected { device_id } => println!("- {device_id:016x} gone"),
    }));
    bus.set_miss_handler(Box::new(|frame, miss| println!("? {miss}: {frame}")));

    let classes: Vec<u32> = bus.registry().services().map(|(class, _)| class).collect();
    for class in classes {
        bus.set_handler(
            class,
            Box::new(|dispatch| println!("{}", render_dispatch(dispatch))),
        );
        bus.add_event_handler(class, Box::new(|event| println!("{}", render_event(event))));
    }
}

fn render_dispatch(dispatch: &Dispatch) -> String {
    let arrow = if dispatch.is_command { ">" } else { "<" };
    let mut out = format!(
        "{} {:016x}/{}",
        arrow, dispatch.device_id, dispatch.service_index
    );
    match &dispatch.name {
        Some(name) => write!(&mut out, " {name}").unwrap(),
        None => write!(&mut out, " {}", kind_label(dispatch.kind)).unwrap(),
    }
    match &dispatch.values {
        Some(values) => write!(&mut out, " {}", values_to_json(values)).unwrap(),
        None if !dispatch.payload.is_empty() => {
            write!(&mut out, " {}", hex::encode(&dispatch.payload)).unwrap()
        }
        None => {}
    }
    out
}

fn kind_label(kind: CommandKind) -> String {
    match kind {
        CommandKind::GetRegister(code) => format!("get {code:#x}"),
        CommandKind::SetRegister(code) => format!("set {code:#x}"),
        CommandKind::Action(code) => format!("action {code:#x}"),
    }
}

fn render_event(event: &EventNotification) -> String {
    let mut out = format!("! {:016x}/{}", event.device_id, event.service_index);
    match &event.name {
        Some(name) => write!(&mut out, " {name}").unwrap(),
        None => write!(&mut out, " event {:#x}", event.event_id).unwrap(),
    }
    write!(&mut out, " #{}", event.event_arg).unwrap();
    match &event.values {
        Some(values) if !values.is_empty() => {
            write!(&mut out, " {}", values_to_json(values)).unwrap()
        }
        _ if !event.payload.is_empty() => {
            write!(&mut out, " {}", hex::encode(&event.payload)).unwrap()
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use jdbus_lib::constants::{
        SERVICE_INDEX_CONTROL, SERVICE_INDEX_PIPE, SRV_BUTTON, SRV_THERMOMETER,
    };
    use serde_json::json;

    #[test]
    fn pack_and_unpack_agree() {
        let hex = pack_hex("u8 u16", "[1, 513]").unwrap();
        assert_eq!(hex, "010102");
        assert_eq!(unpack_json("u8 u16", &hex).unwrap(), json!([1, 513]));
    }

    #[test]
    fn unpack_fixed_point() {
        assert_eq!(unpack_json("u22.10", "00560000").unwrap(), json!([21.5]));
    }

    #[test]
    fn json_value_mapping() {
        assert_eq!(json_to_value(&json!(7)).unwrap(), Value::Unsigned(7));
        assert_eq!(json_to_value(&json!(-7)).unwrap(), Value::Signed(-7));
        assert_eq!(json_to_value(&json!(1.25)).unwrap(), Value::Float(1.25));
        assert_eq!(
            json_to_value(&json!("on")).unwrap(),
            Value::String("on".into())
        );
        assert_eq!(
            json_to_value(&json!({"hex": "a1b2"})).unwrap(),
            Value::Bytes(Bytes::from_static(&[0xa1, 0xb2]))
        );
    }

    #[test]
    fn arrays_of_arrays_become_records() {
        let records = json_to_value(&json!([[1, 2], [3, 4]])).unwrap();
        assert!(matches!(records, Value::Records(ref rows) if rows.len() == 2));
        let flat = json_to_value(&json!([1, 2])).unwrap();
        assert!(matches!(flat, Value::Array(ref items) if items.len() == 2));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(pack_hex("u8", "[null]").is_err());
        assert!(pack_hex("u8", "{\"not\": \"an array\"}").is_err());
        assert!(json_to_value(&json!({"raw": "a1b2"})).is_err());
        assert!(json_to_value(&json!({"hex": "zz"})).is_err());
    }

    #[test]
    fn decode_renders_announce() {
        let announce = Announce {
            restart_counter: 5,
            flags: 0,
            packet_count: 10,
            service_classes: vec![SRV_BUTTON],
        };
        let frame = Frame::report(
            0x1122_3344_5566_7788,
            SERVICE_INDEX_CONTROL,
            0x0000,
            announce.to_payload(),
        );
        let raw = frame.encode().unwrap();
        let registry = Registry::core().unwrap();
        let text = render_frame(&Frame::decode(&raw).unwrap(), &registry);
        assert!(text.contains("announce"));
        assert!(text.contains("restart 5"));
        assert!(text.contains("button"));
    }

    #[test]
    fn describes_pipe_command_words() {
        let word = PipeCommand::new()
            .with_counter(3)
            .with_close(false)
            .with_metadata(true)
            .with_port(12)
            .to_command_word();
        let frame = Frame::command(0x1122_3344_5566_7788, SERVICE_INDEX_PIPE, word, Bytes::new());
        assert_eq!(describe_command(&frame), "pipe port 12 counter 3 metadata");
    }

    #[test]
    fn service_filter_resolves_names_and_classes() {
        let registry = Registry::core().unwrap();
        assert_eq!(resolve_service_arg(&registry, "button").unwrap(), SRV_BUTTON);
        assert_eq!(
            resolve_service_arg(&registry, "0x1421bac7").unwrap(),
            SRV_THERMOMETER
        );
        assert!(resolve_service_arg(&registry, "toaster").is_err());
    }
}
