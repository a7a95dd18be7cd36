//! Channel descriptors.
//!
//! A descriptor is the canonical string form of a channel's transport kind and
//! connection parameters. It is the cache key of the broker, so two descriptors
//! address the same channel exactly when their string forms are equal.
//!
//! ```text
//! serial:<port>?baud=<int>&timeout=<float>
//! visa:<resource>?timeout=<float>
//! http://<host>[:<port>][/<path>]   (or https://)
//! dummy:<name>
//! ```

use crate::error::{AppResult, LabError};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Baud rate used when a serial descriptor omits `baud`.
pub const DEFAULT_SERIAL_BAUD: u32 = 9600;
/// Timeout (seconds) used when a serial descriptor omits `timeout`.
pub const DEFAULT_SERIAL_TIMEOUT: f64 = 1.0;
/// Timeout (seconds) used when a VISA descriptor omits `timeout`.
pub const DEFAULT_VISA_TIMEOUT: f64 = 5.0;

/// Parsed channel descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    /// OS serial port
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
        port: String,
        /// Baud rate
        baud: u32,
        /// Read timeout in seconds
        timeout: f64,
    },
    /// VISA resource
    Visa {
        /// Resource string, e.g. `GPIB0::5::INSTR`
        resource: String,
        /// I/O timeout in seconds
        timeout: f64,
    },
    /// HTTP service; the descriptor itself (minus trailing `/`) is the base URL
    Http {
        /// Base URL without trailing slash
        base_url: String,
    },
    /// Simulated channel
    Dummy {
        /// Free-form channel name
        name: String,
    },
}

impl Descriptor {
    /// Transport kind: `serial`, `visa`, `http` or `dummy`.
    pub fn kind(&self) -> &'static str {
        match self {
            Descriptor::Serial { .. } => "serial",
            Descriptor::Visa { .. } => "visa",
            Descriptor::Http { .. } => "http",
            Descriptor::Dummy { .. } => "dummy",
        }
    }

    /// Transport timeout, where the kind carries one.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Descriptor::Serial { timeout, .. } | Descriptor::Visa { timeout, .. } => {
                Some(Duration::from_secs_f64(*timeout))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Serial {
                port,
                baud,
                timeout,
            } => write!(
                f,
                "serial:{port}?baud={baud}&timeout={}",
                format_float(*timeout)
            ),
            Descriptor::Visa { resource, timeout } => {
                write!(f, "visa:{resource}?timeout={}", format_float(*timeout))
            }
            Descriptor::Http { base_url } => f.write_str(base_url),
            Descriptor::Dummy { name } => write!(f, "dummy:{name}"),
        }
    }
}

impl FromStr for Descriptor {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_descriptor(s)
    }
}

/// Parse a descriptor string.
pub fn parse_descriptor(s: &str) -> AppResult<Descriptor> {
    if let Some(rest) = s.strip_prefix("serial:") {
        let (port, query) = split_query(rest);
        if port.is_empty() {
            return Err(invalid(s, "missing serial port"));
        }
        let mut baud = DEFAULT_SERIAL_BAUD;
        let mut timeout = DEFAULT_SERIAL_TIMEOUT;
        for (key, value) in query_pairs(query) {
            match key {
                "baud" => {
                    baud = value
                        .parse()
                        .map_err(|_| invalid(s, &format!("baud '{value}' is not an integer")))?
                }
                "timeout" => timeout = parse_timeout(s, value)?,
                _ => {}
            }
        }
        return Ok(Descriptor::Serial {
            port: port.to_string(),
            baud,
            timeout,
        });
    }

    if let Some(rest) = s.strip_prefix("visa:") {
        let (resource, query) = split_query(rest);
        if resource.is_empty() {
            return Err(invalid(s, "missing VISA resource"));
        }
        let mut timeout = DEFAULT_VISA_TIMEOUT;
        for (key, value) in query_pairs(query) {
            if key == "timeout" {
                timeout = parse_timeout(s, value)?;
            }
        }
        return Ok(Descriptor::Visa {
            resource: resource.to_string(),
            timeout,
        });
    }

    if let Some(rest) = s
        .strip_prefix("http://")
        .or_else(|| s.strip_prefix("https://"))
    {
        if rest.trim_end_matches('/').is_empty() {
            return Err(invalid(s, "missing HTTP host"));
        }
        return Ok(Descriptor::Http {
            base_url: s.trim_end_matches('/').to_string(),
        });
    }

    if let Some(name) = s.strip_prefix("dummy:") {
        if name.is_empty() {
            return Err(invalid(s, "missing dummy channel name"));
        }
        return Ok(Descriptor::Dummy {
            name: name.to_string(),
        });
    }

    Err(invalid(s, "unrecognised prefix"))
}

/// `serial:<port>?baud=<baud>&timeout=<timeout>`
pub fn build_serial_descriptor(port: &str, baud: u32, timeout: f64) -> String {
    Descriptor::Serial {
        port: port.to_string(),
        baud,
        timeout,
    }
    .to_string()
}

/// `visa:<resource>?timeout=<timeout>`
pub fn build_visa_descriptor(resource: &str, timeout: f64) -> String {
    Descriptor::Visa {
        resource: resource.to_string(),
        timeout,
    }
    .to_string()
}

/// `http://<host>:<port><base_path>` with any trailing `/` removed.
pub fn build_http_descriptor(host: &str, port: u16, base_path: &str) -> String {
    let path = if base_path.is_empty() || base_path.starts_with('/') {
        base_path.to_string()
    } else {
        format!("/{base_path}")
    };
    format!("http://{host}:{port}{path}")
        .trim_end_matches('/')
        .to_string()
}

/// `dummy:<name>`
pub fn build_dummy_descriptor(name: &str) -> String {
    format!("dummy:{name}")
}

/// Integral values keep one decimal (`1.0`), others use the shortest
/// representation that parses back to the same value.
fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn split_query(rest: &str) -> (&str, &str) {
    rest.split_once('?').unwrap_or((rest, ""))
}

fn query_pairs(query: &str) -> impl Iterator<Item = (&str, &str)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

fn parse_timeout(descriptor: &str, value: &str) -> AppResult<f64> {
    match value.parse::<f64>() {
        Ok(t) if t.is_finite() && t >= 0.0 => Ok(t),
        _ => Err(invalid(
            descriptor,
            &format!("timeout '{value}' is not a non-negative number"),
        )),
    }
}

fn invalid(descriptor: &str, reason: &str) -> LabError {
    LabError::InvalidDescriptor(format!("'{descriptor}': {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_round_trip() {
        let cases = [
            ("/dev/ttyUSB0", 9600, 1.0),
            ("COM3", 115200, 0.25),
            ("/dev/serial/by-id/usb-Prologix_GPIB-if00", 57600, 10.0),
            ("/dev/ttyS1", 300, 0.0),
        ];
        for (port, baud, timeout) in cases {
            let s = build_serial_descriptor(port, baud, timeout);
            assert_eq!(
                parse_descriptor(&s).unwrap(),
                Descriptor::Serial {
                    port: port.to_string(),
                    baud,
                    timeout
                }
            );
            assert_eq!(parse_descriptor(&s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_canonical_forms() {
        assert_eq!(
            build_serial_descriptor("/dev/ttyUSB0", 9600, 1.0),
            "serial:/dev/ttyUSB0?baud=9600&timeout=1.0"
        );
        assert_eq!(
            build_visa_descriptor("GPIB0::5::INSTR", 2.5),
            "visa:GPIB0::5::INSTR?timeout=2.5"
        );
        assert_eq!(build_dummy_descriptor("bench"), "dummy:bench");
        assert_eq!(
            build_http_descriptor("10.7.0.4", 8345, ""),
            "http://10.7.0.4:8345"
        );
        assert_eq!(
            build_http_descriptor("10.7.0.4", 8345, "api/"),
            "http://10.7.0.4:8345/api"
        );
    }

    #[test]
    fn test_defaults_when_query_omitted() {
        assert_eq!(
            parse_descriptor("serial:/dev/ttyUSB1").unwrap(),
            Descriptor::Serial {
                port: "/dev/ttyUSB1".into(),
                baud: 9600,
                timeout: 1.0
            }
        );
        assert_eq!(
            parse_descriptor("visa:TCPIP0::10.7.0.114::5025::SOCKET").unwrap(),
            Descriptor::Visa {
                resource: "TCPIP0::10.7.0.114::5025::SOCKET".into(),
                timeout: 5.0
            }
        );
    }

    #[test]
    fn test_http_trailing_slash_stripped() {
        let d = parse_descriptor("https://dbay.lab:8345/").unwrap();
        assert_eq!(
            d,
            Descriptor::Http {
                base_url: "https://dbay.lab:8345".into()
            }
        );
        assert_eq!(d.kind(), "http");
    }

    #[test]
    fn test_invalid_descriptors() {
        for bad in [
            "tcp:10.0.0.1",
            "",
            "serial:",
            "serial:/dev/ttyUSB0?baud=fast",
            "serial:/dev/ttyUSB0?timeout=-1",
            "visa:?timeout=1.0",
            "dummy:",
            "http://",
        ] {
            assert!(
                matches!(parse_descriptor(bad), Err(LabError::InvalidDescriptor(_))),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn test_timeout_duration() {
        let d: Descriptor = "serial:/dev/ttyUSB0?baud=9600&timeout=0.5".parse().unwrap();
        assert_eq!(d.timeout(), Some(Duration::from_millis(500)));
        assert_eq!(parse_descriptor("dummy:x").unwrap().timeout(), None);
    }
}
