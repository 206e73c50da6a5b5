//! Endpoint identifiers, CBHE (`ipn:<node>.<service>`) form (glossary: EID).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A Compressed Bundling Header Encoding endpoint id: `ipn:<node>.<service>`.
///
/// This is also the type the catalog (C2) keys on — possibly after the
/// Masker collaborator has rewritten it to a logical destination distinct
/// from the bundle's on-wire final destination (glossary: "Logical EID").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Eid {
    pub node: u64,
    pub service: u64,
}

impl Eid {
    pub const NULL: Eid = Eid { node: 0, service: 0 };

    pub fn new(node: u64, service: u64) -> Self {
        Eid { node, service }
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipn:{}.{}", self.node, self.service)
    }
}

impl std::str::FromStr for Eid {
    type Err = crate::error::BundleCodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("ipn:")
            .ok_or(crate::error::BundleCodecError::MalformedBundle("EID missing ipn: scheme"))?;
        let (node_str, service_str) = rest
            .split_once('.')
            .ok_or(crate::error::BundleCodecError::MalformedBundle("EID missing '.' separator"))?;
        let node = node_str
            .parse()
            .map_err(|_| crate::error::BundleCodecError::MalformedBundle("EID node not a u64"))?;
        let service = service_str
            .parse()
            .map_err(|_| crate::error::BundleCodecError::MalformedBundle("EID service not a u64"))?;
        Ok(Eid { node, service })
    }
}
