//! DSN parsing helpers.
//!
//! A DSN is a URL: `<scheme>://<authority>/<path>?<options>`. Each backend
//! recognizes its own option set; this module provides the shared typed
//! accessors over query pairs.

use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::error::{Error, Result};

/// A parsed DSN with typed option accessors.
#[derive(Debug, Clone)]
pub struct Dsn {
    url: Url,
}

impl Dsn {
    pub fn parse(dsn: &str) -> Result<Self> {
        let url = Url::parse(dsn)
            .map_err(|e| Error::InvalidInput(format!("invalid dsn {:?}: {}", dsn, e)))?;
        Ok(Self { url })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host_str(&self) -> Option<&str> {
        self.url.host_str()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port()
    }

    /// The raw URL path, leading slash included.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// The URL path trimmed of surrounding slashes, e.g. the table name of a
    /// wide-column DSN.
    pub fn path_segment(&self) -> &str {
        self.url.path().trim_matches('/')
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// The raw string value of a query option, if present.
    pub fn option(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// A boolean option; only the literal `true` enables it.
    pub fn bool_option(&self, name: &str) -> bool {
        self.option(name).as_deref() == Some("true")
    }

    pub fn usize_option(&self, name: &str, default: usize) -> Result<usize> {
        match self.option(name) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e| {
                Error::InvalidInput(format!("dsn: invalid value for {}: {}", name, e))
            }),
        }
    }

    pub fn u64_option(&self, name: &str, default: u64) -> Result<u64> {
        match self.option(name) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e| {
                Error::InvalidInput(format!("dsn: invalid value for {}: {}", name, e))
            }),
        }
    }

    /// A duration option expressed in whole seconds.
    pub fn seconds_option(&self, name: &str, default: Duration) -> Result<Duration> {
        match self.option(name) {
            None => Ok(default),
            Some(raw) => {
                let secs: u64 = raw.parse().map_err(|e| {
                    Error::InvalidInput(format!("dsn: invalid value for {}: {}", name, e))
                })?;
                Ok(Duration::from_secs(secs))
            }
        }
    }

    /// A hex-encoded bytes option, e.g. `keyPrefix=0901`.
    pub fn hex_option(&self, name: &str) -> Result<Option<Bytes>> {
        match self.option(name) {
            None => Ok(None),
            Some(raw) => decode_hex(&raw)
                .map(Some)
                .map_err(|e| Error::InvalidInput(format!("dsn: decoding {} as hex: {}", name, e))),
        }
    }

    /// Returns the DSN with the given query options removed.
    ///
    /// Transforms `kv://path?a=1&b=2&c=3` into `kv://path?b=2` when passing
    /// `a` and `c`. Used when forwarding a DSN to a layer that must not see
    /// locally-consumed options.
    pub fn without_options(&self, keys: &[&str]) -> String {
        let remaining: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(k, _)| !keys.contains(&k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut url = self.url.clone();
        if remaining.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut()
                .clear()
                .extend_pairs(remaining.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        url.to_string()
    }
}

fn decode_hex(s: &str) -> std::result::Result<Bytes, String> {
    if s.len() % 2 != 0 {
        return Err("odd number of hex digits".to_string());
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    for i in (0..s.len()).step_by(2) {
        let byte = u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string())?;
        out.push(byte);
    }
    Ok(Bytes::from(out))
}
