use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub mod api;
pub mod wire;

/// Key under which the dashboard keeps its durable snapshot.
pub const STORAGE_KEY: &str = "riotpot_storage";

/// File name used when the snapshot is downloaded or uploaded.
pub const SNAPSHOT_FILE: &str = "riotpot-state.json";

/// A closed set of choices that is shown as `{value, label}` locally and sent
/// as the bare `value` code to an instance.
pub trait SelectOption: Sized + Copy + 'static {
    const OPTIONS: &'static [Self];

    fn value(self) -> &'static str;
    fn label(self) -> &'static str;

    fn from_code(code: &str) -> Option<Self> {
        Self::OPTIONS.iter().copied().find(|o| o.value() == code)
    }
}

#[derive(Serialize)]
struct OptionObject<'a> {
    value: &'a str,
    label: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OptionRepr {
    Object { value: String },
    Code(String),
}

fn serialize_option<O, S>(opt: O, serializer: S) -> Result<S::Ok, S::Error>
where
    O: SelectOption,
    S: Serializer,
{
    OptionObject {
        value: opt.value(),
        label: opt.label(),
    }
    .serialize(serializer)
}

fn deserialize_option<'de, O, D>(deserializer: D) -> Result<O, D::Error>
where
    O: SelectOption,
    D: Deserializer<'de>,
{
    let code = match OptionRepr::deserialize(deserializer)? {
        OptionRepr::Object { value } => value,
        OptionRepr::Code(code) => code,
    };
    O::from_code(&code).ok_or_else(|| de::Error::custom(format!("unknown option code '{}'", code)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl SelectOption for Network {
    const OPTIONS: &'static [Self] = &[Network::Tcp, Network::Udp];

    fn value(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Network::Tcp => "TCP",
            Network::Udp => "UDP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Interaction {
    #[default]
    High,
    Low,
}

impl SelectOption for Interaction {
    const OPTIONS: &'static [Self] = &[Interaction::High, Interaction::Low];

    fn value(self) -> &'static str {
        match self {
            Interaction::High => "high",
            Interaction::Low => "low",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Interaction::High => "High",
            Interaction::Low => "Low",
        }
    }
}

impl Serialize for Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_option(*self, serializer)
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_option(deserializer)
    }
}

impl Serialize for Interaction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_option(*self, serializer)
    }
}

impl<'de> Deserialize<'de> for Interaction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_option(deserializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub network: Network,
    pub interaction: Interaction,
    pub host: String,
    pub port: u16,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            network: Network::default(),
            interaction: Interaction::default(),
            host: String::new(),
            port: 1,
        }
    }
}

/// A named bundle of service definitions. Services are copies taken when they
/// were added, not references into the service registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Instance {
    pub id: u64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub description: String,
    pub profile: Option<Profile>,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            id: 0,
            name: "Default".to_string(),
            host: "localhost".to_string(),
            port: 2022,
            description: "Default instance".to_string(),
            profile: None,
        }
    }
}

impl Instance {
    /// `host:port` of the instance API.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    Running,
    #[default]
    Stopped,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Running => "running",
            ProxyStatus::Stopped => "stopped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(ProxyStatus::Running),
            "stopped" => Some(ProxyStatus::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached mirror of a proxy living on an instance. The id is assigned remotely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyRecord {
    pub id: String,
    pub port: u16,
    pub status: ProxyStatus,
    pub service: Service,
}

/// Full capture of the local collections. Proxies are never part of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub services: Vec<Service>,
    pub profiles: Vec<Profile>,
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastVariant {
    #[default]
    Info,
    Error,
}

impl ToastVariant {
    pub fn name(&self) -> &'static str {
        match self {
            ToastVariant::Info => "Info",
            ToastVariant::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Toast {
    pub variant: ToastVariant,
    pub title: String,
    pub message: String,
    pub show: bool,
    pub raised_at: Option<DateTime<Utc>>,
}
