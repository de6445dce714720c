#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// Logical device address on a shared link, just a type-safe wrapper around `u8`
///
/// On Modbus this is the slave / unit id. Several units may be reachable through the
/// same physical [`Link`] (a serial bus or a TCP gateway).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct UnitId {
    /// underlying raw value
    pub value: u8,
}

impl UnitId {
    /// Create a new unit id
    pub const fn new(value: u8) -> Self {
        Self { value }
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new(0x01)
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04X}", self.value)
    }
}

/// Number of data bits in a serial character
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(rename_all = "snake_case"))]
pub enum DataBits {
    /// 5 bits per character
    Five,
    /// 6 bits per character
    Six,
    /// 7 bits per character
    Seven,
    /// 8 bits per character
    Eight,
}

/// Parity checking mode of a serial line
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(rename_all = "snake_case"))]
pub enum Parity {
    /// No parity bit
    None,
    /// Parity bit sets odd number of 1 bits
    Odd,
    /// Parity bit sets even number of 1 bits
    Even,
}

/// Number of stop bits
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(rename_all = "snake_case"))]
pub enum StopBits {
    /// One stop bit
    One,
    /// Two stop bits
    Two,
}

/// Flow control of a serial line
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(rename_all = "snake_case"))]
pub enum FlowControl {
    /// No flow control
    None,
    /// Flow control using XON/XOFF bytes
    Software,
    /// Flow control using RTS/CTS signals
    Hardware,
}

/// Line parameters applied when a serial port is opened
///
/// The parameters are part of the link identity. They cannot change on an open handle,
/// a different set of parameters is a different [`Link`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct SerialSettings {
    /// Baud rate (in symbols-per-second)
    pub baud_rate: u32,
    /// Number of bits used to represent a character sent on the line
    pub data_bits: DataBits,
    /// Type of signalling to use for controlling data transfer
    pub flow_control: FlowControl,
    /// Type of parity to use for error checking
    pub parity: Parity,
    /// Number of bits to use to signal the end of a character
    pub stop_bits: StopBits,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

#[cfg(feature = "serial")]
impl From<DataBits> for tokio_serial::DataBits {
    fn from(value: DataBits) -> Self {
        match value {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

#[cfg(feature = "serial")]
impl From<Parity> for tokio_serial::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

#[cfg(feature = "serial")]
impl From<StopBits> for tokio_serial::StopBits {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

#[cfg(feature = "serial")]
impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(value: FlowControl) -> Self {
        match value {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// Kind of physical transport behind a [`Link`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// TCP socket
    Tcp,
    /// Serial port
    Serial,
    /// Transport resolved by a user supplied `ConnectionFactory`
    Other,
}

/// Physical identity of a communication link
///
/// Two endpoints that share a `Link` share one connection pool, regardless of the
/// unit id they address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Link {
    /// TCP host and port
    Tcp {
        /// host name or IP address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Serial device and line parameters
    Serial {
        /// OS path of the device, e.g. `/dev/ttyUSB0` or `COM3`
        path: String,
        /// line parameters
        settings: SerialSettings,
    },
    /// Named transport created by a custom factory
    Other(String),
}

impl Link {
    /// TCP link to `host:port`
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Link::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Serial link on `path` using `settings`
    pub fn serial(path: impl Into<String>, settings: SerialSettings) -> Self {
        Link::Serial {
            path: path.into(),
            settings,
        }
    }

    /// The kind of transport
    pub fn kind(&self) -> LinkKind {
        match self {
            Link::Tcp { .. } => LinkKind::Tcp,
            Link::Serial { .. } => LinkKind::Serial,
            Link::Other(_) => LinkKind::Other,
        }
    }

    /// Endpoint addressing `unit` on this link
    pub fn unit(&self, unit: UnitId) -> Endpoint {
        Endpoint::new(self.clone(), unit)
    }
}

impl std::fmt::Display for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Link::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Link::Serial { path, settings } => {
                let parity = match settings.parity {
                    Parity::None => 'N',
                    Parity::Odd => 'O',
                    Parity::Even => 'E',
                };
                let data_bits = match settings.data_bits {
                    DataBits::Five => 5,
                    DataBits::Six => 6,
                    DataBits::Seven => 7,
                    DataBits::Eight => 8,
                };
                let stop_bits = match settings.stop_bits {
                    StopBits::One => 1,
                    StopBits::Two => 2,
                };
                write!(
                    f,
                    "serial://{path}@{}-{data_bits}{parity}{stop_bits}",
                    settings.baud_rate
                )
            }
            Link::Other(name) => write!(f, "other://{name}"),
        }
    }
}

/// A unit reachable through a link
///
/// Requests are serialized per `Endpoint`, connections are pooled per [`Link`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// physical link
    pub link: Link,
    /// logical unit on the link
    pub unit: UnitId,
}

impl Endpoint {
    /// Create an endpoint from its parts
    pub fn new(link: Link, unit: UnitId) -> Self {
        Self { link, unit }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.link, self.unit)
    }
}

/// Discriminated link configuration as read from a host application config file
///
/// ```toml
/// [link.serial]
/// path = "/dev/ttyUSB0"
/// baud_rate = 19200
/// parity = "even"
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(rename_all = "snake_case"))]
pub enum LinkConfig {
    /// TCP socket
    Tcp {
        /// host name or IP address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Serial port
    Serial {
        /// OS path of the device
        path: String,
        /// line parameters
        #[cfg_attr(feature = "serialization", serde(flatten))]
        settings: SerialSettings,
    },
}

impl From<LinkConfig> for Link {
    fn from(config: LinkConfig) -> Self {
        match config {
            LinkConfig::Tcp { host, port } => Link::Tcp { host, port },
            LinkConfig::Serial { path, settings } => Link::Serial { path, settings },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn endpoints_on_the_same_link_share_link_identity() {
        let link = Link::serial("/dev/ttyS0", SerialSettings::default());
        let a = link.unit(UnitId::new(1));
        let b = link.unit(UnitId::new(2));

        assert_ne!(a, b);
        assert_eq!(a.link, b.link);

        let mut pools: HashMap<Link, usize> = HashMap::new();
        *pools.entry(a.link.clone()).or_default() += 1;
        *pools.entry(b.link.clone()).or_default() += 1;
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[&link], 2);
    }

    #[test]
    fn line_parameters_are_part_of_the_identity() {
        let slow = Link::serial("/dev/ttyS0", SerialSettings::default());
        let fast = Link::serial(
            "/dev/ttyS0",
            SerialSettings {
                baud_rate: 115_200,
                ..SerialSettings::default()
            },
        );
        assert_ne!(slow, fast);
    }

    #[test]
    fn formats_links_for_logging() {
        assert_eq!(Link::tcp("10.0.0.5", 502).to_string(), "tcp://10.0.0.5:502");
        let settings = SerialSettings {
            baud_rate: 19200,
            parity: Parity::Even,
            ..SerialSettings::default()
        };
        assert_eq!(
            Link::serial("/dev/ttyUSB0", settings).to_string(),
            "serial:///dev/ttyUSB0@19200-8E1"
        );
        assert_eq!(
            Link::tcp("gw", 502).unit(UnitId::new(0x11)).to_string(),
            "tcp://gw:502/0x11"
        );
    }

    #[test]
    fn link_config_converts_into_link() {
        let link: Link = LinkConfig::Tcp {
            host: "plc".to_string(),
            port: 1502,
        }
        .into();
        assert_eq!(link, Link::tcp("plc", 1502));
        assert_eq!(link.kind(), LinkKind::Tcp);
    }
}
