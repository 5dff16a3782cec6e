//! Instance records and the znode path layout.
//!
//! ```text
//! /{namespace}/{service}/{service}0000000000
//!                       /{service}0000000001
//! ```
//!
//! Namespace and service nodes are permanent; instance nodes are
//! ephemeral-sequential and carry an encoded [`InstanceInfo`].

use std::{fmt, net::Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::error::{ApplyError, CodecError, ConfigError};

/// Identity of one registered process, stored as an instance node's payload.
///
/// Immutable once built; lives as long as the node that holds it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceInfo {
    service_name: String,
    address: Ipv4Addr,
    port: u16,
}

impl InstanceInfo {
    /// Create a new instance record
    pub fn new(service_name: impl Into<String>, address: Ipv4Addr, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            address,
            port,
        }
    }

    /// name of the service this instance belongs to
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// advertised IPv4 address
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// advertised port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Encode for storage in a node payload.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a node payload. Empty payloads (name-only nodes) fail.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Display for InstanceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.service_name, self.address, self.port)
    }
}

/// Checks that a service name can be used as a single path segment.
pub fn validate_service_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::Missing("application_name"));
    }
    if name.contains('/') {
        return Err(ConfigError::Invalid {
            key: "application_name",
            reason: format!("'{name}' must not contain '/'"),
        });
    }
    Ok(())
}

/// The root path under which every service subtree lives, e.g. `/service`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(String);

impl Namespace {
    /// Validate a namespace path. It must be exactly one non-empty segment
    /// with a leading `/`.
    pub fn new(path: impl Into<String>) -> Result<Self, ConfigError> {
        let path = path.into();
        if path.trim().is_empty() {
            return Err(ConfigError::Missing("namespace"));
        }
        let Some(segment) = path.strip_prefix('/') else {
            return Err(ConfigError::Invalid {
                key: "namespace",
                reason: format!("'{path}' must start with '/'"),
            });
        };
        if segment.is_empty() || segment.contains('/') {
            return Err(ConfigError::Invalid {
                key: "namespace",
                reason: format!("'{path}' must be a single path segment"),
            });
        }
        Ok(Self(path))
    }

    /// namespace path, e.g. `/service`
    pub fn path(&self) -> &str {
        &self.0
    }

    fn segment(&self) -> &str {
        &self.0[1..]
    }

    /// permanent parent of a service's instances, `/{ns}/{service}`
    pub fn service_path(&self, service_name: &str) -> String {
        format!("{}/{service_name}", self.0)
    }

    /// prefix given to the store for sequential instance names,
    /// `/{ns}/{service}/{service}`
    pub fn instance_prefix(&self, service_name: &str) -> String {
        format!("{}/{service_name}/{service_name}", self.0)
    }

    /// full path of one instance node
    pub fn instance_path(&self, service_name: &str, instance_id: &str) -> String {
        format!("{}/{service_name}/{instance_id}", self.0)
    }

    /// Parse `/{namespace}/{service}/{instance}`. Paths outside this
    /// namespace, at any other depth, or with an empty service or instance
    /// segment are rejected.
    pub fn parse_instance(&self, path: &str) -> Result<InstancePath, ApplyError> {
        let malformed = || ApplyError::MalformedPath(path.to_owned());
        let mut segments = path.split('/');
        if segments.next() != Some("") || segments.next() != Some(self.segment()) {
            return Err(malformed());
        }
        match (segments.next(), segments.next(), segments.next()) {
            (Some(service_name), Some(instance_id), None)
                if !service_name.is_empty() && !instance_id.is_empty() =>
            {
                Ok(InstancePath {
                    service_name: service_name.to_owned(),
                    instance_id: instance_id.to_owned(),
                })
            }
            _ => Err(malformed()),
        }
    }

    /// Whether `path` is the namespace itself or lies beneath it.
    pub fn contains(&self, path: &str) -> bool {
        match path.strip_prefix(self.0.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `(service name, instance id)` parsed from an instance node path by
/// [`Namespace::parse_instance`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstancePath {
    /// service segment
    pub service_name: String,
    /// store-generated sequential child name
    pub instance_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_round_trip() {
        let info = InstanceInfo::new("order-service", Ipv4Addr::new(10, 0, 0, 5), 8080);
        let bytes = info.encode().unwrap();
        let decoded = InstanceInfo::decode(&bytes).unwrap();
        assert_eq!(decoded, info);
        assert_eq!(decoded.service_name(), "order-service");
        assert_eq!(decoded.address(), Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(decoded.port(), 8080);
    }

    #[test]
    fn test_codec_port_bounds() {
        for port in [0, 1, 65535] {
            let info = InstanceInfo::new("a", Ipv4Addr::new(255, 255, 255, 255), port);
            assert_eq!(InstanceInfo::decode(&info.encode().unwrap()).unwrap(), info);
        }
    }

    #[test]
    fn test_address_is_dotted_quad_on_the_wire() {
        let info = InstanceInfo::new("user-service", Ipv4Addr::new(192, 168, 1, 20), 9000);
        let text = String::from_utf8(info.encode().unwrap()).unwrap();
        assert!(text.contains("\"192.168.1.20\""));
    }

    #[test]
    fn test_decode_rejects_empty_and_foreign_payloads() {
        assert!(InstanceInfo::decode(b"").is_err());
        assert!(InstanceInfo::decode(b"11111").is_err());
        assert!(InstanceInfo::decode(br#"{"service_name":"a","address":"300.1.1.1","port":1}"#)
            .is_err());
        assert!(InstanceInfo::decode(br#"{"service_name":"a","address":"1.1.1.1","port":70000}"#)
            .is_err());
    }

    #[test]
    fn test_display() {
        let info = InstanceInfo::new("order-service", Ipv4Addr::new(10, 0, 0, 6), 8080);
        assert_eq!(info.to_string(), "order-service@10.0.0.6:8080");
    }

    #[test]
    fn test_namespace_validation() {
        assert!(Namespace::new("/service").is_ok());
        assert_eq!(Namespace::new(""), Err(ConfigError::Missing("namespace")));
        assert!(matches!(
            Namespace::new("service"),
            Err(ConfigError::Invalid { key: "namespace", .. })
        ));
        assert!(Namespace::new("/").is_err());
        assert!(Namespace::new("/a/b").is_err());
    }

    #[test]
    fn test_namespace_paths() {
        let ns = Namespace::new("/service").unwrap();
        assert_eq!(ns.service_path("order-service"), "/service/order-service");
        assert_eq!(
            ns.instance_prefix("order-service"),
            "/service/order-service/order-service"
        );
        assert_eq!(
            ns.instance_path("order-service", "order-service0000000003"),
            "/service/order-service/order-service0000000003"
        );
        assert!(ns.contains("/service"));
        assert!(ns.contains("/service/order-service"));
        assert!(!ns.contains("/services/order-service"));
        assert!(!ns.contains("/other"));
    }

    #[test]
    fn test_instance_path_parse() {
        let ns = Namespace::new("/service").unwrap();
        let parsed = ns
            .parse_instance("/service/order-service/order-service0000000000")
            .unwrap();
        assert_eq!(parsed.service_name, "order-service");
        assert_eq!(parsed.instance_id, "order-service0000000000");

        for bad in [
            "",
            "/",
            "/service",
            "/service/order-service",
            "/service//x",
            "/service/x/",
            "service/x/x0",
            // another namespace
            "/other/order-service/order-service0000000000",
            "/services/order-service/order-service0000000000",
            // below an instance node
            "/service/order-service/x/child",
        ] {
            assert!(
                matches!(ns.parse_instance(bad), Err(ApplyError::MalformedPath(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_service_name_validation() {
        assert!(validate_service_name("order-service").is_ok());
        assert_eq!(
            validate_service_name(" "),
            Err(ConfigError::Missing("application_name"))
        );
        assert!(validate_service_name("a/b").is_err());
    }
}
