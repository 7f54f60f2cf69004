//! Allow-list of hardware addresses eligible for presence tracking.
//!
//! One address per line in canonical colon-hex form (`AA:BB:CC:DD:EE:FF`).
//! Anything else is skipped with a warning.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context as _;
use log::warn;
use mac_address::MacAddress;

/// Textual length of `AA:BB:CC:DD:EE:FF`.
pub const ADDRESS_LEN: usize = 17;

/// Two hex digits per octet, octets separated by `:`.
fn is_canonical(text: &str) -> bool {
    text.len() == ADDRESS_LEN
        && text.bytes().enumerate().all(|(i, b)| {
            if i % 3 == 2 {
                b == b':'
            } else {
                b.is_ascii_hexdigit()
            }
        })
}

/// Parse one line, ignoring surrounding whitespace and the line terminator.
pub fn parse_address(line: &str) -> Option<MacAddress> {
    let line = line.trim();
    if !is_canonical(line) {
        return None;
    }
    line.parse().ok()
}

/// Lines that are not UTF-8 are malformed like any other bad entry.
pub fn parse(contents: &[u8]) -> Vec<MacAddress> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::new();

    for (number, raw) in contents.split(|&b| b == b'\n').enumerate() {
        let Ok(line) = std::str::from_utf8(raw) else {
            warn!(
                "Invalid hardware address on line {}: {:?}",
                number + 1,
                String::from_utf8_lossy(raw)
            );
            continue;
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_address(line) {
            Some(address) => {
                if seen.insert(address) {
                    addresses.push(address);
                } else {
                    warn!("Duplicate allow-list entry on line {}: {}", number + 1, address);
                }
            }
            None => warn!("Invalid hardware address on line {}: {:?}", number + 1, line),
        }
    }

    addresses
}

/// Fails only when the file cannot be read at all.
pub async fn load(path: &Path) -> anyhow::Result<Vec<MacAddress>> {
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading allow-list {}", path.display()))?;
    Ok(parse(&contents))
}
