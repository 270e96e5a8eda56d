//! Object addressing.
//!
//! Every remote object lives at a location of the form
//! `[scheme://]host:port/Class/name[?key=value,...]`. The `host:port` part (the
//! *bus*) only routes requests; identity is the `(class, name)` pair.
//!
//! # Example
//!
//! ```
//! use skywire::location::{Location, Name};
//!
//! let loc = Location::parse("tcp://127.0.0.1:7666/Telescope/0").unwrap();
//! assert_eq!(loc.class(), "Telescope");
//! assert_eq!(loc.name(), &Name::Index(0));
//! assert_eq!(loc.to_string(), "127.0.0.1:7666/Telescope/0");
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use uuid::Uuid;

use crate::error::LocationError;

/// Object name: a free-form name or an ordinal among objects of the same class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Name {
    Named(String),
    Index(usize),
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Name::Named(name) => f.write_str(name),
            Name::Index(index) => write!(f, "{index}"),
        }
    }
}

/// A parsed, validated object address.
///
/// Equality and hashing consider only class and name.
#[derive(Debug, Clone)]
pub struct Location {
    host: String,
    port: u16,
    class: String,
    name: Name,
    config: BTreeMap<String, String>,
}

impl Location {
    /// Parse `[scheme://]host:port/Class/name[?k=v,...]`.
    pub fn parse(raw: &str) -> Result<Self, LocationError> {
        let rest = match raw.find("://") {
            Some(idx) => &raw[idx + 3..],
            None => raw,
        };

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };

        let (netloc, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (host, port) = parse_bus(raw, netloc)?;
        let (class, name) = parse_path(raw, path)?;
        let config = match query {
            Some(query) => parse_query(raw, query)?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            host,
            port,
            class,
            name,
            config,
        })
    }

    /// Build a location from parts, applying the same validation as [`parse`](Self::parse).
    pub fn new(host: &str, port: u16, class: &str, name: &str) -> Result<Self, LocationError> {
        Self::parse(&format!("{host}:{port}/{class}/{name}"))
    }

    /// Build an indexed location (`/Class/<index>`).
    pub fn indexed(host: &str, port: u16, class: &str, index: usize) -> Result<Self, LocationError> {
        Self::parse(&format!("{host}:{port}/{class}/{index}"))
    }

    /// Create a location on `bus` (`host:port`, scheme optional).
    ///
    /// When `name` is absent a random `"{class}_{uuid}"` name is generated.
    pub fn create(bus: &str, class: &str, name: Option<&str>) -> Result<Self, LocationError> {
        let bus = bus.split_once("://").map(|(_, b)| b).unwrap_or(bus);
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("{}_{}", class.to_lowercase(), Uuid::new_v4().simple()),
        };
        Self::parse(&format!("{bus}/{class}/{name}"))
    }

    /// Fresh `"{class}_{uuid}"` location on a known-good bus. `class` must be valid.
    pub(crate) fn generated(host: &str, port: u16, class: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            class: class.to_string(),
            name: Name::Named(format!("{}_{}", class.to_lowercase(), Uuid::new_v4().simple())),
            config: BTreeMap::new(),
        }
    }

    /// Resolve `raw` against `base_bus`.
    ///
    /// A bare `/Class/name` path gets the base bus prepended. A full location
    /// is returned as parsed.
    pub fn resolve(raw: &str, base_bus: &str) -> Result<Self, LocationError> {
        let base = parse_bus_only(base_bus)?;
        match Self::parse(raw) {
            Ok(loc) => Ok(loc),
            Err(LocationError::InvalidHost { .. }) => {
                Self::parse(&format!("{}:{}{}", base.0, base.1, raw))
            }
            Err(e) => Err(e),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Options carried in the query string.
    pub fn config(&self) -> &BTreeMap<String, String> {
        &self.config
    }

    /// Whether the name is an ordinal index.
    pub fn is_indexed(&self) -> bool {
        matches!(self.name, Name::Index(_))
    }

    /// `host:port`.
    pub fn bus(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `/Class/name`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.class, self.name)
    }

    /// Same class and name, moved to another bus.
    pub fn with_bus(&self, host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..self.clone()
        }
    }

    /// Same address without query options.
    pub fn without_config(&self) -> Self {
        Self {
            config: BTreeMap::new(),
            ..self.clone()
        }
    }

    /// Whether both locations route to the same bus.
    pub fn same_bus(&self, other: &Location) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.name == other.name
    }
}

impl Eq for Location {}

impl Hash for Location {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}/{}", self.host, self.port, self.class, self.name)?;
        if !self.config.is_empty() {
            f.write_str("?")?;
            for (i, (key, value)) in self.config.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for Location {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_bus_only(bus: &str) -> Result<(String, u16), LocationError> {
    let netloc = bus.split_once("://").map(|(_, b)| b).unwrap_or(bus);
    let netloc = netloc.trim_end_matches('/');
    parse_bus(bus, netloc)
}

fn parse_bus(raw: &str, netloc: &str) -> Result<(String, u16), LocationError> {
    let mut parts = netloc.split(':');
    let (host, port) = match (parts.next(), parts.next(), parts.next()) {
        (Some(host), Some(port), None) => (host, port),
        _ => {
            return Err(LocationError::host(
                raw,
                "expected [scheme://]<host>:<port>",
            ))
        }
    };

    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(LocationError::host(raw, "host is empty or contains spaces"));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| LocationError::host(raw, format!("port '{port}' is not a valid port number")))?;

    Ok((host.to_string(), port))
}

fn parse_path(raw: &str, path: &str) -> Result<(String, Name), LocationError> {
    let Some(path) = path.strip_prefix('/') else {
        return Err(LocationError::path(raw, "path does not start with '/'"));
    };

    let mut parts = path.split('/');
    let (class, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(class), Some(name), None) => (class, name),
        _ => {
            return Err(LocationError::path(
                raw,
                "path is not in the format '/<class>/<name|index>'",
            ))
        }
    };

    if class.is_empty() || class.contains('$') || class.chars().any(char::is_whitespace) {
        return Err(LocationError::path(
            raw,
            "class is empty or contains spaces or '$'",
        ));
    }

    if class.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(LocationError::path(raw, "class cannot start with a number"));
    }

    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(LocationError::path(raw, "name is empty or contains spaces"));
    }

    let name = if name.starts_with(|c: char| c.is_ascii_digit()) {
        if !name.chars().all(|c| c.is_ascii_digit()) {
            return Err(LocationError::path(
                raw,
                "name cannot start with a number unless it is fully numeric",
            ));
        }
        let index = name
            .parse::<usize>()
            .map_err(|_| LocationError::path(raw, "index is out of range"))?;
        Name::Index(index)
    } else {
        Name::Named(name.to_string())
    };

    Ok((class.to_string(), name))
}

fn parse_query(raw: &str, query: &str) -> Result<BTreeMap<String, String>, LocationError> {
    let mut config = BTreeMap::new();
    for pair in query.split(',').filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(LocationError::path(
                raw,
                format!("option '{pair}' is not in the format key=value"),
            ));
        };
        if key.is_empty() {
            return Err(LocationError::path(raw, "option key is empty"));
        }
        config.insert(key.to_string(), value.to_string());
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let loc = Location::parse("tcp://localhost:1000/Class/name").unwrap();
        assert_eq!(loc.host(), "localhost");
        assert_eq!(loc.port(), 1000);
        assert_eq!(loc.class(), "Class");
        assert_eq!(loc.name(), &Name::Named("name".into()));
        assert_eq!(loc.bus(), "localhost:1000");
        assert_eq!(loc.path(), "/Class/name");
        assert!(!loc.is_indexed());
    }

    #[test]
    fn test_parse_without_scheme() {
        let loc = Location::parse("200.100.100.100:1000/Class/name").unwrap();
        assert_eq!(loc.host(), "200.100.100.100");
        assert_eq!(loc.to_string(), "200.100.100.100:1000/Class/name");
    }

    #[test]
    fn test_parse_indexed() {
        let loc = Location::parse("localhost:1000/Camera/12").unwrap();
        assert_eq!(loc.name(), &Name::Index(12));
        assert!(loc.is_indexed());
    }

    #[test]
    fn test_invalid_hosts() {
        for raw in [
            "/Class/name",
            "200.100.100.100/Class/name",
            ":1000/Class/name",
            "local host:1000/Class/name",
            "localhost:port/Class/name",
            "localhost:1000:2/Class/name",
            "localhost:70000/Class/name",
        ] {
            let err = Location::parse(raw).unwrap_err();
            assert!(
                matches!(err, LocationError::InvalidHost { .. }),
                "{raw} -> {err:?}"
            );
        }
    }

    #[test]
    fn test_invalid_paths() {
        for raw in [
            "localhost:1000",
            "localhost:1000/Who/am/I",
            "localhost:1000/Who",
            "localhost:1000/1234/name",
            "localhost:1000/12345Class/o",
            "localhost:1000/Class/1what",
            "localhost:1000/Cl ass/name",
            "localhost:1000/Class/na me",
            "localhost:1000/Cla$s/name",
            "localhost:1000//name",
            "localhost:1000/Class/",
            "localhost:1000/Class/name?novalue",
        ] {
            let err = Location::parse(raw).unwrap_err();
            assert!(
                matches!(err, LocationError::InvalidPath { .. }),
                "{raw} -> {err:?}"
            );
        }
    }

    #[test]
    fn test_display_is_idempotent() {
        for raw in [
            "tcp://localhost:1000/Class/name",
            "127.0.0.1:7666/Camera/0",
            "host:1/Dome/dome?model=ash,slots=3",
        ] {
            let loc = Location::parse(raw).unwrap();
            let again = Location::parse(&loc.to_string()).unwrap();
            assert_eq!(loc.host(), again.host());
            assert_eq!(loc.port(), again.port());
            assert_eq!(loc.class(), again.class());
            assert_eq!(loc.name(), again.name());
            assert_eq!(loc.config(), again.config());
        }
    }

    #[test]
    fn test_query_config() {
        let loc = Location::parse("host:1/Dome/dome?slots=3,model=ash").unwrap();
        assert_eq!(loc.config().get("slots").map(String::as_str), Some("3"));
        assert_eq!(loc.config().get("model").map(String::as_str), Some("ash"));
        assert_eq!(loc.to_string(), "host:1/Dome/dome?model=ash,slots=3");
        assert!(loc.without_config().config().is_empty());
    }

    #[test]
    fn test_equality_ignores_bus() {
        let a = Location::parse("a:1/Class/name").unwrap();
        let b = Location::parse("b:2/Class/name?x=1").unwrap();
        assert_eq!(a, b);

        let c = Location::parse("a:1/Class/other").unwrap();
        assert_ne!(a, c);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_create_generates_name() {
        let loc = Location::create("tcp://localhost:1000", "Telescope", None).unwrap();
        match loc.name() {
            Name::Named(name) => assert!(name.starts_with("telescope_")),
            Name::Index(_) => panic!("generated name must not be an index"),
        }

        let named = Location::create("localhost:1000", "Telescope", Some("meade")).unwrap();
        assert_eq!(named.to_string(), "localhost:1000/Telescope/meade");
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let rel = Location::resolve("/Camera/main", "tcp://10.0.0.1:9000").unwrap();
        assert_eq!(rel.to_string(), "10.0.0.1:9000/Camera/main");

        let abs = Location::resolve("other:1/Camera/main", "10.0.0.1:9000").unwrap();
        assert_eq!(abs.bus(), "other:1");
        assert_eq!(abs.to_string(), "other:1/Camera/main");

        assert!(Location::resolve("/Camera/1x", "10.0.0.1:9000").is_err());
    }
}
