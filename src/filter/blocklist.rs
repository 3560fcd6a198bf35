//! Sinkhole blocklist.
//!
//! Maps fully-qualified domain names to the IPv4 address handed out instead
//! of the real one. Built once at startup and never mutated afterwards.

use std::net::Ipv4Addr;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::Error;

/// Domains to intercept and the address to answer them with.
///
/// Names are stored trailing-dot terminated and compared case-sensitively,
/// matching how the query codec renders question names.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    entries: FxHashMap<String, Ipv4Addr>,
}

impl Blocklist {
    /// Create an empty blocklist: every query is forwarded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a blocklist from `(domain, address)` pairs.
    pub fn from_map<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Ipv4Addr)>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|(domain, addr)| (fully_qualified(domain.as_ref()), addr))
            .collect();

        Self { entries }
    }

    /// Load a JSON object of `"domain": "ipv4"` pairs.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::Blocklist {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_json(&content).map_err(|reason| Error::Blocklist {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parse the JSON blocklist format.
    pub fn from_json(content: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
        let Value::Object(object) = value else {
            return Err("expected a JSON object of domain to address".to_string());
        };

        let mut entries = Vec::with_capacity(object.len());
        for (domain, addr) in object {
            let addr = addr
                .as_str()
                .and_then(|s| s.parse::<Ipv4Addr>().ok())
                .ok_or_else(|| format!("{domain}: {addr} is not an IPv4 address"))?;
            entries.push((domain, addr));
        }

        Ok(Self::from_map(entries))
    }

    /// Look up the sinkhole address for a fully-qualified domain.
    pub fn lookup(&self, domain: &str) -> Option<Ipv4Addr> {
        self.entries.get(domain).copied()
    }

    /// Returns the number of domains in the blocklist.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Append the root label when it is missing.
fn fully_qualified(domain: &str) -> String {
    if domain.ends_with('.') {
        domain.to_string()
    } else {
        format!("{domain}.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> Blocklist {
        Blocklist::from_map([
            ("malware.example.", Ipv4Addr::new(10, 0, 0, 1)),
            ("practicalmalwareanalysis.com", Ipv4Addr::new(127, 0, 0, 1)),
        ])
    }

    #[test]
    fn lookup_exact_match() {
        let blocklist = sample();

        assert_eq!(
            blocklist.lookup("malware.example."),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn keys_are_made_fully_qualified() {
        let blocklist = sample();

        assert_eq!(
            blocklist.lookup("practicalmalwareanalysis.com."),
            Some(Ipv4Addr::new(127, 0, 0, 1))
        );
        assert_eq!(blocklist.lookup("practicalmalwareanalysis.com"), None);
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let blocklist = sample();

        assert_eq!(blocklist.lookup("MALWARE.example."), None);
    }

    #[test]
    fn lookup_does_not_match_subdomains() {
        let blocklist = sample();

        assert_eq!(blocklist.lookup("ads.malware.example."), None);
    }

    #[test]
    fn lookup_handles_empty_input() {
        let blocklist = sample();

        assert_eq!(blocklist.lookup(""), None);
    }

    #[test]
    fn from_json_parses_object() {
        let blocklist =
            Blocklist::from_json(r#"{"malware.example.": "10.0.0.1", "heias.com": "0.0.0.0"}"#)
                .unwrap();

        assert_eq!(blocklist.len(), 2);
        assert_eq!(blocklist.lookup("heias.com."), Some(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn from_json_accepts_empty_object() {
        let blocklist = Blocklist::from_json("{}").unwrap();

        assert!(blocklist.is_empty());
    }

    #[test]
    fn from_json_rejects_bad_address() {
        let err = Blocklist::from_json(r#"{"malware.example.": "not-an-ip"}"#).unwrap_err();

        assert!(err.contains("malware.example."));
    }

    #[test]
    fn from_json_rejects_non_object() {
        assert!(Blocklist::from_json(r#"["malware.example."]"#).is_err());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"malware.example.": "10.0.0.1"}}"#).unwrap();

        let blocklist = Blocklist::load(file.path()).unwrap();

        assert_eq!(blocklist.len(), 1);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let err = Blocklist::load("/nonexistent/blacklist.json").unwrap_err();

        assert!(matches!(err, Error::Blocklist { .. }));
    }
}
