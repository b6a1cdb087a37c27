use crate::error::JdError;
use crate::pack::PayloadFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::Display;

/// How a register may be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
    Const,
}

/// One register definition as it appears in registry JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSpec {
    #[serde(with = "hex16")]
    pub code: u16,
    pub name: String,
    pub access: AccessMode,
    pub format: String,
}

/// One command definition as it appears in registry JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(with = "hex16")]
    pub code: u16,
    pub name: String,
    /// Request payload format, when the command carries arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Format of the matching report, when the command has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_format: Option<String>,
    /// True when the request payload is a pipe descriptor.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub opens_pipe: bool,
}

/// One event definition as it appears in registry JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSpec {
    #[serde(with = "hex32")]
    pub code: u32,
    pub name: String,
    /// Format of payload bytes following the event id and argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Register/command/event definitions for one scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedSpec {
    #[serde(default)]
    pub registers: Vec<RegisterSpec>,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
}

/// Definitions for one service class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(with = "hex32")]
    pub service_class: u32,
    #[serde(flatten)]
    pub defs: SharedSpec,
}

/// The JSON shape of a registry: shared system definitions plus services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryData {
    pub version: String,
    #[serde(default)]
    pub system: SharedSpec,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// A register with its format parsed and ready to use.
#[derive(Debug, Clone)]
pub struct RegisterEntry {
    pub name: String,
    pub access: AccessMode,
    pub format: PayloadFormat,
}

#[derive(Debug, Clone)]
pub struct CommandEntry {
    pub name: String,
    pub request: Option<PayloadFormat>,
    pub report: Option<PayloadFormat>,
    pub opens_pipe: bool,
}

#[derive(Debug, Clone)]
pub struct EventEntry {
    pub name: String,
    pub payload: Option<PayloadFormat>,
}

/// Compiled definitions for one service class (or the system scope).
#[derive(Debug, Clone, Default)]
pub struct ServiceEntry {
    pub name: String,
    pub registers: BTreeMap<u16, RegisterEntry>,
    pub commands: BTreeMap<u16, CommandEntry>,
    pub events: BTreeMap<u32, EventEntry>,
}

impl ServiceEntry {
    fn compile(name: &str, defs: &SharedSpec) -> Result<Self, JdError> {
        let mut entry = ServiceEntry {
            name: name.to_string(),
            ..Default::default()
        };
        for reg in &defs.registers {
            let compiled = RegisterEntry {
                name: reg.name.clone(),
                access: reg.access,
                format: compile_format("register", &reg.name, &reg.format)?,
            };
            if entry.registers.insert(reg.code, compiled).is_some() {
                return Err(duplicate(name, "register", reg.code as u32));
            }
        }
        for cmd in &defs.commands {
            let compiled = CommandEntry {
                name: cmd.name.clone(),
                request: cmd
                    .format
                    .as_deref()
                    .map(|f| compile_format("command", &cmd.name, f))
                    .transpose()?,
                report: cmd
                    .report_format
                    .as_deref()
                    .map(|f| compile_format("command report", &cmd.name, f))
                    .transpose()?,
                opens_pipe: cmd.opens_pipe,
            };
            if entry.commands.insert(cmd.code, compiled).is_some() {
                return Err(duplicate(name, "command", cmd.code as u32));
            }
        }
        for ev in &defs.events {
            let compiled = EventEntry {
                name: ev.name.clone(),
                payload: ev
                    .format
                    .as_deref()
                    .map(|f| compile_format("event", &ev.name, f))
                    .transpose()?,
            };
            if entry.events.insert(ev.code, compiled).is_some() {
                return Err(duplicate(name, "event", ev.code));
            }
        }
        Ok(entry)
    }
}

fn compile_format(kind: &str, name: &str, format: &str) -> Result<PayloadFormat, JdError> {
    PayloadFormat::parse(format).map_err(|e| JdError::InvalidRegistry(format!("{kind} `{name}`: {e}")))
}

fn duplicate(service: &str, kind: &str, code: u32) -> JdError {
    JdError::InvalidRegistry(format!("service `{service}`: duplicate {kind} {code:#x}"))
}

/// Metadata table mapping (service_class, code) to names and payload formats.
///
/// Registries load from JSON and compile every format string up front, so a
/// bad format surfaces at load time instead of on a hot dispatch path.
/// Lookups fall back to the shared system scope when a service defines no
/// entry of its own for a code, mirroring how services inherit the common
/// registers and commands.
#[derive(Debug, Clone)]
pub struct Registry {
    version: String,
    system: ServiceEntry,
    services: BTreeMap<u32, ServiceEntry>,
}

impl Registry {
    pub fn from_data(data: &RegistryData) -> Result<Self, JdError> {
        let system = ServiceEntry::compile("system", &data.system)?;
        let mut services = BTreeMap::new();
        for spec in &data.services {
            let entry = ServiceEntry::compile(&spec.name, &spec.defs)?;
            if services.insert(spec.service_class, entry).is_some() {
                return Err(JdError::InvalidRegistry(format!(
                    "duplicate service class {:#010x}",
                    spec.service_class
                )));
            }
        }
        Ok(Registry {
            version: data.version.clone(),
            system,
            services,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, JdError> {
        let data: RegistryData = serde_json::from_str(json)?;
        Self::from_data(&data)
    }

    /// The built-in table covering the control service, the system scope and
    /// the common peripheral services.
    pub fn core() -> Result<Self, JdError> {
        Self::from_json(include_str!("../data/core-services.json"))
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn has_service(&self, class: u32) -> bool {
        self.services.contains_key(&class)
    }

    pub fn service(&self, class: u32) -> Option<&ServiceEntry> {
        self.services.get(&class)
    }

    pub fn service_name(&self, class: u32) -> Option<&str> {
        self.services.get(&class).map(|s| s.name.as_str())
    }

    /// Shared definitions every service inherits.
    pub fn system(&self) -> &ServiceEntry {
        &self.system
    }

    /// All services, ordered by class.
    pub fn services(&self) -> impl Iterator<Item = (u32, &ServiceEntry)> {
        self.services.iter().map(|(class, entry)| (*class, entry))
    }

    /// Resolve a register, falling back to the system scope.
    pub fn register(&self, class: u32, code: u16) -> Option<&RegisterEntry> {
        self.services
            .get(&class)
            .and_then(|s| s.registers.get(&code))
            .or_else(|| self.system.registers.get(&code))
    }

    /// Resolve a command, falling back to the system scope.
    pub fn command(&self, class: u32, code: u16) -> Option<&CommandEntry> {
        self.services
            .get(&class)
            .and_then(|s| s.commands.get(&code))
            .or_else(|| self.system.commands.get(&code))
    }

    /// Resolve an event, falling back to the system scope.
    pub fn event(&self, class: u32, code: u32) -> Option<&EventEntry> {
        self.services
            .get(&class)
            .and_then(|s| s.events.get(&code))
            .or_else(|| self.system.events.get(&code))
    }
}

fn parse_code_str(s: &str) -> Option<u64> {
    let t = s.trim();
    match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => t.parse::<u64>().ok(),
    }
}

/// Codes render as hex strings in JSON; bare numbers are accepted on input.
macro_rules! hex_code_module {
    ($name:ident, $ty:ty) => {
        mod $name {
            use serde::de::Error;
            use serde::{Deserialize, Deserializer, Serializer};

            #[derive(Deserialize)]
            #[serde(untagged)]
            enum Raw {
                Num(u64),
                Str(String),
            }

            pub fn serialize<S: Serializer>(v: &$ty, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&format!("{v:#x}"))
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<$ty, D::Error> {
                let n = match Raw::deserialize(d)? {
                    Raw::Num(n) => n,
                    Raw::Str(s) => super::parse_code_str(&s)
                        .ok_or_else(|| D::Error::custom(format!("bad code `{s}`")))?,
                };
                <$ty>::try_from(n).map_err(|_| D::Error::custom(format!("code {n:#x} too wide")))
            }
        }
    };
}

hex_code_module!(hex16, u16);
hex_code_module!(hex32, u32);

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_registry(format: &str) -> String {
        format!(
            r#"{{
                "version": "test",
                "system": {{
                    "registers": [
                        {{"code": "0x101", "name": "reading", "access": "read_only", "format": "i32"}}
                    ]
                }},
                "services": [
                    {{
                        "name": "pressure",
                        "service_class": "0x12345678",
                        "registers": [
                            {{"code": "0x180", "name": "kpa", "access": "read_only", "format": "{format}"}}
                        ]
                    }}
                ]
            }}"#
        )
    }

    #[test]
    fn loads_and_resolves_with_fallback() {
        let reg = Registry::from_json(&tiny_registry("u22.10")).unwrap();
        assert_eq!(reg.version(), "test");
        let own = reg.register(0x12345678, 0x180).unwrap();
        assert_eq!(own.name, "kpa");
        // 0x101 not defined on the service, resolved from system scope
        let fallback = reg.register(0x12345678, 0x101).unwrap();
        assert_eq!(fallback.name, "reading");
        // fallback applies even for classes the registry has never heard of
        assert!(reg.register(0xdeadbeef, 0x101).is_some());
        assert!(reg.register(0x12345678, 0x999).is_none());
    }

    #[test]
    fn bad_format_fails_at_load_time() {
        let err = Registry::from_json(&tiny_registry("q99")).unwrap_err();
        assert!(matches!(err, JdError::InvalidRegistry(_)));
        assert!(err.to_string().contains("kpa"));
    }

    #[test]
    fn duplicate_codes_are_rejected() {
        let json = r#"{
            "version": "test",
            "services": [{
                "name": "dup",
                "service_class": "0x1",
                "commands": [
                    {"code": "0x80", "name": "a"},
                    {"code": "0x80", "name": "b"}
                ]
            }]
        }"#;
        assert!(matches!(
            Registry::from_json(json),
            Err(JdError::InvalidRegistry(_))
        ));
    }

    #[test]
    fn codes_accept_decimal_numbers() {
        let json = r#"{
            "version": "test",
            "services": [{
                "name": "svc",
                "service_class": 258,
                "registers": [
                    {"code": 257, "name": "reading", "access": "read_only", "format": "u16"}
                ]
            }]
        }"#;
        let reg = Registry::from_json(json).unwrap();
        assert!(reg.register(0x102, 0x101).is_some());
    }

    #[test]
    fn data_roundtrips_through_serde() {
        let reg = RegistryData {
            version: "v".to_string(),
            system: SharedSpec::default(),
            services: vec![ServiceSpec {
                name: "svc".to_string(),
                service_class: 0x1b43b70b,
                defs: SharedSpec {
                    registers: vec![],
                    commands: vec![CommandSpec {
                        code: 0x80,
                        name: "open".to_string(),
                        format: Some("b[12]".to_string()),
                        report_format: Some("u16".to_string()),
                        opens_pipe: true,
                    }],
                    events: vec![],
                },
            }],
        };
        let json = serde_json::to_string(&reg).unwrap();
        assert!(json.contains("0x1b43b70b"));
        let back: RegistryData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.services[0].service_class, 0x1b43b70b);
        assert!(back.services[0].defs.commands[0].opens_pipe);
    }
}
