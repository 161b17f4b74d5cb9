//! Wire error catalog.
//!
//! Error replies are `e<slot><code>` where `slot` is the three-digit slot
//! in scope or the literal `xxx`. The code table is parsed once from the
//! embedded [`errors.md`] list so the wire contract stays documented in a
//! single place; codes are stable across runs.

use std::collections::HashMap;
use std::sync::OnceLock;

const CATALOG_SOURCE: &str = include_str!("errors.md");

/// Slot field of an error reply when no slot is in scope.
pub const NO_SLOT: &str = "xxx";

/// One entry of the wire error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    name: &'static str,
    id: &'static str,
}

impl ErrorCode {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    /// Render the reply line (without terminator) for the given slot.
    pub fn response(&self, slot: Option<usize>) -> String {
        match slot {
            Some(slot) => format!("e{:03}{}", slot, self.id),
            None => format!("e{}{}", NO_SLOT, self.id),
        }
    }
}

const UNKNOWN: ErrorCode = ErrorCode {
    name: "UNKNOWN",
    id: "999",
};

static CATALOG: OnceLock<HashMap<&'static str, ErrorCode>> = OnceLock::new();

/// Look up a wire error by its symbolic name.
///
/// Unknown names map to the reserved `999` code rather than panicking, so
/// a bad call site degrades to a visible-but-harmless reply.
pub fn wire_error(name: &str) -> ErrorCode {
    match catalog().get(name) {
        Some(code) => *code,
        None => {
            tracing::error!(name, "unknown wire error requested");
            UNKNOWN
        }
    }
}

fn catalog() -> &'static HashMap<&'static str, ErrorCode> {
    CATALOG.get_or_init(|| parse_catalog(CATALOG_SOURCE))
}

/// Entries are headings of the form `## NNN: NAME`.
fn parse_catalog(source: &'static str) -> HashMap<&'static str, ErrorCode> {
    let mut table = HashMap::new();
    for line in source.lines() {
        let Some(rest) = line.strip_prefix("## ") else {
            continue;
        };
        let Some((id, name)) = rest.split_once(": ") else {
            continue;
        };
        let id = id.trim();
        let name = name.trim();
        if id.len() != 3 || !id.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_uppercase() || b == b'_') {
            continue;
        }
        table.insert(name, ErrorCode { name, id });
    }
    table
}
