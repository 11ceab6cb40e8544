//! Endpoint URIs and the protocol table
//!
//! Control-plane endpoint addressing: `<proto>://<host>:<port>[/path]`.
//! The protocol fixes the packet format (plain RTP, RTP plus an FEC
//! scheme, bare repair stream, RTCP), which interface it may be bound
//! to, whether URI paths make sense, and the default port if any.

use std::fmt;

use crate::error::{Error, Result};
use crate::packet::FecScheme;

/// Pipeline interface an endpoint attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    /// Audio source packets (RTP, possibly FEC-protected).
    AudioSource,
    /// FEC repair packets.
    AudioRepair,
    /// RTCP control packets.
    AudioControl,
}

/// Endpoint protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Plain RTP.
    Rtp,
    /// RTP source stream protected with Reed-Solomon m=8.
    RtpRs8m,
    /// Reed-Solomon m=8 repair stream.
    Rs8m,
    /// RTP source stream protected with LDPC-Staircase.
    RtpLdpc,
    /// LDPC-Staircase repair stream.
    Ldpc,
    /// RTCP.
    Rtcp,
    /// RTSP control.
    Rtsp,
}

impl Protocol {
    /// Scheme name as it appears in URIs.
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Rtp => "rtp",
            Protocol::RtpRs8m => "rtp+rs8m",
            Protocol::Rs8m => "rs8m",
            Protocol::RtpLdpc => "rtp+ldpc",
            Protocol::Ldpc => "ldpc",
            Protocol::Rtcp => "rtcp",
            Protocol::Rtsp => "rtsp",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "rtp" => Protocol::Rtp,
            "rtp+rs8m" => Protocol::RtpRs8m,
            "rs8m" => Protocol::Rs8m,
            "rtp+ldpc" => Protocol::RtpLdpc,
            "ldpc" => Protocol::Ldpc,
            "rtcp" => Protocol::Rtcp,
            "rtsp" => Protocol::Rtsp,
            _ => return None,
        })
    }

    /// Interface this protocol belongs to.
    pub fn interface(self) -> Interface {
        match self {
            Protocol::Rtp | Protocol::RtpRs8m | Protocol::RtpLdpc => Interface::AudioSource,
            Protocol::Rs8m | Protocol::Ldpc => Interface::AudioRepair,
            Protocol::Rtcp | Protocol::Rtsp => Interface::AudioControl,
        }
    }

    /// FEC scheme implied by the protocol, if any.
    pub fn fec_scheme(self) -> Option<FecScheme> {
        match self {
            Protocol::RtpRs8m | Protocol::Rs8m => Some(FecScheme::ReedSolomonM8),
            Protocol::RtpLdpc | Protocol::Ldpc => Some(FecScheme::LdpcStaircase),
            _ => None,
        }
    }

    /// Default port, for protocols that have one.
    pub fn default_port(self) -> Option<u16> {
        match self {
            Protocol::Rtsp => Some(554),
            _ => None,
        }
    }

    /// Whether a URI path is meaningful for this protocol.
    pub fn path_supported(self) -> bool {
        matches!(self, Protocol::Rtsp)
    }
}

/// A parsed endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    /// Protocol.
    pub proto: Protocol,
    /// Host name or address literal.
    pub host: String,
    /// Port, explicit or protocol default.
    pub port: u16,
    /// Optional path (RTSP only).
    pub path: Option<String>,
}

impl EndpointUri {
    /// Parse `<proto>://<host>:<port>[/path]`.
    pub fn parse(uri: &str) -> Result<Self> {
        let (proto_str, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::BadUri(format!("missing scheme: {}", uri)))?;
        let proto = Protocol::from_name(proto_str)
            .ok_or_else(|| Error::BadUri(format!("unknown protocol: {}", proto_str)))?;

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, Some(format!("/{}", path))),
            None => (rest, None),
        };

        if path.is_some() && !proto.path_supported() {
            return Err(Error::BadUri(format!(
                "protocol {} does not support a path",
                proto.name()
            )));
        }

        // IPv6 literals keep their brackets: [::1]:4000.
        let (host, port_str) = if let Some(end) = authority.find(']') {
            let host = &authority[..=end];
            match authority[end + 1..].strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => (host, None),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(Error::BadUri(format!("missing host: {}", uri)));
        }

        let port = match port_str {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| Error::BadUri(format!("bad port: {}", p)))?,
            None => proto
                .default_port()
                .ok_or_else(|| Error::BadUri(format!("missing port: {}", uri)))?,
        };

        Ok(EndpointUri {
            proto,
            host: host.to_string(),
            port,
            path,
        })
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.proto.name(), self.host, self.port)?;
        if let Some(path) = &self.path {
            write!(f, "{}", path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_rtp() {
        let uri = EndpointUri::parse("rtp://192.168.0.5:10001").unwrap();
        assert_eq!(uri.proto, Protocol::Rtp);
        assert_eq!(uri.host, "192.168.0.5");
        assert_eq!(uri.port, 10001);
        assert_eq!(uri.proto.interface(), Interface::AudioSource);
        assert!(uri.proto.fec_scheme().is_none());
    }

    #[test]
    fn test_fec_protocols() {
        let uri = EndpointUri::parse("rtp+rs8m://host:5000").unwrap();
        assert_eq!(uri.proto.fec_scheme(), Some(FecScheme::ReedSolomonM8));
        assert_eq!(uri.proto.interface(), Interface::AudioSource);

        let uri = EndpointUri::parse("ldpc://host:5001").unwrap();
        assert_eq!(uri.proto.fec_scheme(), Some(FecScheme::LdpcStaircase));
        assert_eq!(uri.proto.interface(), Interface::AudioRepair);
    }

    #[test]
    fn test_rtsp_default_port_and_path() {
        let uri = EndpointUri::parse("rtsp://server/stream1").unwrap();
        assert_eq!(uri.port, 554);
        assert_eq!(uri.path.as_deref(), Some("/stream1"));
        assert_eq!(uri.to_string(), "rtsp://server:554/stream1");
    }

    #[test]
    fn test_rtp_requires_port() {
        assert!(EndpointUri::parse("rtp://host").is_err());
    }

    #[test]
    fn test_path_rejected_for_rtp() {
        assert!(EndpointUri::parse("rtp://host:1000/path").is_err());
    }

    #[test]
    fn test_ipv6_literal() {
        let uri = EndpointUri::parse("rtcp://[::1]:8000").unwrap();
        assert_eq!(uri.host, "[::1]");
        assert_eq!(uri.port, 8000);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(EndpointUri::parse("not a uri").is_err());
        assert!(EndpointUri::parse("ftp://host:1").is_err());
        assert!(EndpointUri::parse("rtp://:1000").is_err());
        assert!(EndpointUri::parse("rtp://host:99999").is_err());
    }
}
