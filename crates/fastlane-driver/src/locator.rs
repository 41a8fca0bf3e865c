//! Service locator option lookup.
//!
//! A locator names a driver and its options, e.g.
//! `basic+dpdk:mac=02:00:00:00:00:01,devport=0,gbs=10`. Only the first `:`
//! separates the protocol, so option values may contain colons (MAC
//! addresses); options are separated by `,`.

use crate::error::{LocatorError, LocatorResult};
use std::fmt;
use std::str::FromStr;

/// A parsed service locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLocator {
    original: String,
    protocol: String,
    options: Vec<(String, String)>,
}

impl ServiceLocator {
    /// Parse a locator string.
    ///
    /// # Errors
    /// Returns `LocatorError::Malformed` if there is no protocol prefix or an
    /// option lacks `=`.
    pub fn parse(locator: &str) -> LocatorResult<Self> {
        let locator = locator.trim();
        let (protocol, rest) = locator
            .split_once(':')
            .ok_or_else(|| LocatorError::Malformed(format!("missing ':' in '{locator}'")))?;
        if protocol.is_empty() {
            return Err(LocatorError::Malformed(format!(
                "empty protocol in '{locator}'"
            )));
        }

        let mut options = Vec::new();
        for pair in rest.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                LocatorError::Malformed(format!("option '{pair}' in '{locator}' has no value"))
            })?;
            options.push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            original: locator.to_string(),
            protocol: protocol.to_string(),
            options,
        })
    }

    /// The string this locator was parsed from.
    pub fn original_string(&self) -> &str {
        &self.original
    }

    /// Protocol prefix, e.g. `basic+udp`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Whether `key` is present.
    pub fn has_option(&self, key: &str) -> bool {
        self.options.iter().any(|(k, _)| k == key)
    }

    /// Raw value of `key`. The last occurrence wins.
    ///
    /// # Errors
    /// `LocatorError::NoSuchKey` if the option is absent.
    pub fn option_str(&self, key: &str) -> LocatorResult<&str> {
        self.options
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| LocatorError::NoSuchKey {
                key: key.to_string(),
                locator: self.original.clone(),
            })
    }

    /// Value of `key` parsed as `T`.
    ///
    /// # Errors
    /// `NoSuchKey` if absent, `BadValue` if the value does not parse.
    pub fn option<T: FromStr>(&self, key: &str) -> LocatorResult<T> {
        let raw = self.option_str(key)?;
        raw.parse::<T>().map_err(|_| LocatorError::BadValue {
            key: key.to_string(),
            value: raw.to_string(),
            locator: self.original.clone(),
        })
    }

    /// Like [`option`](Self::option) but absent keys yield `None`.
    ///
    /// # Errors
    /// `BadValue` if the option is present but malformed.
    pub fn option_or_none<T: FromStr>(&self, key: &str) -> LocatorResult<Option<T>> {
        match self.option(key) {
            Ok(v) => Ok(Some(v)),
            Err(LocatorError::NoSuchKey { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl FromStr for ServiceLocator {
    type Err = LocatorError;

    fn from_str(s: &str) -> LocatorResult<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let sl = ServiceLocator::parse("basic+udp:host=127.0.0.1,port=11000").unwrap();
        assert_eq!(sl.protocol(), "basic+udp");
        assert_eq!(sl.option_str("host").unwrap(), "127.0.0.1");
        assert_eq!(sl.option::<u16>("port").unwrap(), 11000);
        assert!(sl.has_option("port"));
        assert!(!sl.has_option("gbs"));
    }

    #[test]
    fn test_parse_mac_value_keeps_colons() {
        let sl = ServiceLocator::parse("basic+dpdk:mac=02:00:00:00:00:01,devport=1").unwrap();
        assert_eq!(sl.option_str("mac").unwrap(), "02:00:00:00:00:01");
        assert_eq!(sl.option::<u8>("devport").unwrap(), 1);
    }

    #[test]
    fn test_parse_empty_options() {
        let sl = ServiceLocator::parse("basic+infud:").unwrap();
        assert_eq!(sl.protocol(), "basic+infud");
        assert!(!sl.has_option("lid"));
    }

    #[test]
    fn test_missing_and_bad_value_are_distinct() {
        let sl = ServiceLocator::parse("basic+udp:host=localhost,port=eleven").unwrap();
        assert!(matches!(
            sl.option::<u16>("gbs"),
            Err(LocatorError::NoSuchKey { .. })
        ));
        assert!(matches!(
            sl.option::<u16>("port"),
            Err(LocatorError::BadValue { .. })
        ));
    }

    #[test]
    fn test_option_or_none() {
        let sl = ServiceLocator::parse("basic+dpdk:gbs=x").unwrap();
        assert_eq!(sl.option_or_none::<u32>("devport").unwrap(), None);
        assert!(sl.option_or_none::<u32>("gbs").is_err());
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            ServiceLocator::parse("no-colon"),
            Err(LocatorError::Malformed(_))
        ));
        assert!(matches!(
            ServiceLocator::parse("udp:port"),
            Err(LocatorError::Malformed(_))
        ));
        assert!(ServiceLocator::parse(":a=b").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let s = "basic+infud:lid=3,qpn=17";
        let sl: ServiceLocator = s.parse().unwrap();
        assert_eq!(sl.to_string(), s);
        assert_eq!(sl.original_string(), s);
    }
}
