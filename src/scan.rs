//! Scan-result types (spec section 6). Real DNS-SD/USB enumeration is
//! collaborator-level and out of scope; [`Scanner`] is the seam real
//! discovery backends plug into, so the rest of the crate stays
//! testable against a fixed, hand-built result set.

/// One discovered responder: a human-readable description and the URI
/// that would open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub description: String,
    pub uri: String,
}

/// A source of scan results. A real implementation backs this with
/// mDNS/DNS-SD for `ip:` discovery or `libusb` device enumeration for
/// `usb:` discovery; tests substitute a fixed `Vec<ScanEntry>`.
pub trait Scanner {
    fn scan(&self) -> crate::error::Result<Vec<ScanEntry>>;
}

/// A [`Scanner`] backed by a fixed list, for tests and for callers that
/// already have a result set (e.g. from a config file).
pub struct StaticScanner(pub Vec<ScanEntry>);

impl Scanner for StaticScanner {
    fn scan(&self) -> crate::error::Result<Vec<ScanEntry>> {
        Ok(self.0.clone())
    }
}

/// Resolves a discovery request (empty host/body) to the single
/// matching entry, per spec 6's "requires exactly one match" rule.
pub fn resolve_unique(scanner: &dyn Scanner) -> crate::error::Result<ScanEntry> {
    let mut entries = scanner.scan()?;
    match entries.len() {
        1 => Ok(entries.remove(0)),
        0 => Err(crate::error::IiodError::NotFound),
        _ => Err(crate::error::IiodError::InvalidArgument(
            "discovery matched more than one responder".into(),
        )),
    }
}
