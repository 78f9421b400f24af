//! Source definition strings and derived identifiers.
//!
//! A source definition looks like
//! `name:key1=val1,key2="quoted, value",key3=val3`. The part before the
//! first `:` names the source; the remainder is a comma-separated option
//! list whose values may be double-quoted to embed commas.

use std::collections::BTreeMap;

use wavecap_proto::checksum::checksum;

/// Options parsed from a source definition.
pub type SourceOptions = BTreeMap<String, String>;

/// Parses a source definition into its name and option map.
///
/// Returns `None` for malformed input (a key without `=`, or an
/// unterminated quote); callers must check before use.
pub fn parse_definition(definition: &str) -> Option<(String, SourceOptions)> {
    let Some((name, rest)) = definition.split_once(':')
    else {
        return Some((definition.to_owned(), SourceOptions::new()));
    };

    let mut options = SourceOptions::new();
    let mut right = rest;

    while !right.is_empty() {
        let eq = right.find('=')?;
        let key = &right[..eq];
        right = &right[eq + 1..];

        let value = if let Some(quoted) = right.strip_prefix('"') {
            let end = quoted.find('"')?;
            right = &quoted[end + 1..];
            // a comma after the closing quote separates the next option
            right = right.strip_prefix(',').unwrap_or(right);
            &quoted[..end]
        }
        else {
            match right.find(',') {
                Some(comma) => {
                    let value = &right[..comma];
                    right = &right[comma + 1..];
                    value
                }
                None => {
                    let value = right;
                    right = "";
                    value
                }
            }
        };

        options.insert(key.to_owned(), value.to_owned());
    }

    Some((name.to_owned(), options))
}

/// Derives the stable identifier for a source.
///
/// The first group is the frame checksum of the driver name as exactly 8
/// uppercase hex digits, zero-padded; the tail is the first 12 characters
/// of the device address. The result is deterministic so the same hardware
/// reports the same identifier across restarts. It is collision-tolerant,
/// not cryptographically unique.
pub fn make_uuid(driver: &str, address: &str) -> String {
    let tail = &address[..address.len().min(12)];
    format!("{:08X}-0000-0000-0000-{tail}", checksum(driver.as_bytes()))
}
