//! URI parsing for the `ip:` and `usb:` schemes (spec section 6).
//!
//! Deliberately a small hand-rolled parser rather than a combinator
//! dependency: the grammar is two fixed prefixes and a handful of
//! delimiter-split fields.

use thiserror::Error;

const DEFAULT_PORT: u16 = 30431;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UriError {
    #[error("unrecognized URI scheme (expected \"ip:\" or \"usb:\"): {0}")]
    UnknownScheme(String),
    #[error("invalid ip: URI: {0}")]
    InvalidIp(String),
    #[error("invalid usb: URI: {0}")]
    InvalidUsb(String),
}

/// A parsed `ip:` URI. An empty host means "discover by DNS-SD",
/// requiring exactly one responder found (enforced by the caller that
/// drives discovery, not by the parser).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpUri {
    pub host: String,
    pub port: u16,
}

impl IpUri {
    pub fn is_discovery(&self) -> bool {
        self.host.is_empty()
    }
}

/// A parsed `usb:` URI. An empty body means "scan", requiring exactly
/// one match found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbUri {
    pub bus: u8,
    pub address: u8,
    pub interface: u8,
}

impl UsbUri {
    pub fn is_discovery(&self, body_was_empty: bool) -> bool {
        body_was_empty
    }
}

/// A fully parsed URI of either scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Uri {
    Ip(IpUri),
    Usb { usb: UsbUri, discover: bool },
}

/// Parses `uri` as either `ip:...` or `usb:...`.
pub fn parse(uri: &str) -> Result<Uri, UriError> {
    if let Some(rest) = uri.strip_prefix("ip:") {
        return parse_ip(rest).map(Uri::Ip);
    }
    if let Some(rest) = uri.strip_prefix("usb:") {
        let discover = rest.is_empty();
        return parse_usb(rest).map(|usb| Uri::Usb { usb, discover });
    }
    Err(UriError::UnknownScheme(uri.to_string()))
}

fn parse_ip(body: &str) -> Result<IpUri, UriError> {
    if body.is_empty() {
        return Ok(IpUri {
            host: String::new(),
            port: DEFAULT_PORT,
        });
    }
    match body.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| UriError::InvalidIp(format!("bad port: {port_str}")))?;
            Ok(IpUri {
                host: host.to_string(),
                port,
            })
        }
        _ => Ok(IpUri {
            host: body.to_string(),
            port: DEFAULT_PORT,
        }),
    }
}

fn parse_usb(body: &str) -> Result<UsbUri, UriError> {
    if body.is_empty() {
        return Ok(UsbUri {
            bus: 0,
            address: 0,
            interface: 0,
        });
    }
    let mut parts = body.split('.');
    let bus = parts
        .next()
        .ok_or_else(|| UriError::InvalidUsb(body.to_string()))?;
    let address = parts
        .next()
        .ok_or_else(|| UriError::InvalidUsb(format!("missing <address> in {body}")))?;
    let interface = parts.next().unwrap_or("0");
    if parts.next().is_some() {
        return Err(UriError::InvalidUsb(format!(
            "too many '.'-separated fields in {body}"
        )));
    }

    let parse_field = |s: &str| -> Result<u8, UriError> {
        s.parse::<u8>()
            .map_err(|_| UriError::InvalidUsb(format!("expected a decimal number 0..=255, got {s:?}")))
    };

    Ok(UsbUri {
        bus: parse_field(bus)?,
        address: parse_field(address)?,
        interface: parse_field(interface)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_with_host_and_port() {
        let uri = parse("ip:192.168.1.1:30432").unwrap();
        assert_eq!(
            uri,
            Uri::Ip(IpUri {
                host: "192.168.1.1".into(),
                port: 30432
            })
        );
    }

    #[test]
    fn ip_host_only_defaults_port() {
        let uri = parse("ip:analog.local").unwrap();
        assert_eq!(
            uri,
            Uri::Ip(IpUri {
                host: "analog.local".into(),
                port: DEFAULT_PORT
            })
        );
    }

    #[test]
    fn ip_empty_host_is_discovery() {
        let uri = parse("ip:").unwrap();
        match uri {
            Uri::Ip(ip) => assert!(ip.is_discovery()),
            _ => panic!("expected Ip"),
        }
    }

    #[test]
    fn usb_full_triplet() {
        let uri = parse("usb:3.14.2").unwrap();
        assert_eq!(
            uri,
            Uri::Usb {
                usb: UsbUri {
                    bus: 3,
                    address: 14,
                    interface: 2
                },
                discover: false
            }
        );
    }

    #[test]
    fn usb_interface_defaults_to_zero() {
        let uri = parse("usb:3.14").unwrap();
        assert_eq!(
            uri,
            Uri::Usb {
                usb: UsbUri {
                    bus: 3,
                    address: 14,
                    interface: 0
                },
                discover: false
            }
        );
    }

    #[test]
    fn usb_empty_body_is_discovery() {
        let uri = parse("usb:").unwrap();
        match uri {
            Uri::Usb { discover, .. } => assert!(discover),
            _ => panic!("expected Usb"),
        }
    }

    #[test]
    fn usb_number_out_of_range_is_rejected() {
        assert!(parse("usb:3.999").is_err());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert_eq!(
            parse("serial:/dev/ttyUSB0"),
            Err(UriError::UnknownScheme("serial:/dev/ttyUSB0".into()))
        );
    }
}
