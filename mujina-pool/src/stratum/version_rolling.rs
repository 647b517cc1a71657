//! BIP 320 version rolling.
//!
//! Miners that roll header version bits negotiate a mask through
//! `mining.configure` and tag each submission with the bits they
//! rolled. The pool only ever grants bits inside the BIP 320 region.

use serde_json::{json, Value};

use crate::job::MAX_VERSION_MASK;

/// Outcome of a `version-rolling` extension request: the result
/// object to merge into the `mining.configure` reply, and the mask
/// the session is granted, if any.
pub fn negotiate(requested_mask: Option<&Value>) -> (Value, Option<u32>) {
    let requested = match requested_mask {
        None => MAX_VERSION_MASK,
        Some(value) => match parse_mask(value) {
            Some(mask) => mask,
            None => {
                let result = json!({
                    "version-rolling": "Invalid version-rolling.mask parameter.",
                });
                return (result, None);
            }
        },
    };
    let granted = requested & MAX_VERSION_MASK;
    let result = json!({
        "version-rolling": true,
        "version-rolling.mask": format!("{granted:08x}"),
    });
    (result, Some(granted))
}

/// Parses a mask parameter: exactly eight hex digits.
fn parse_mask(value: &Value) -> Option<u32> {
    let mask = value.as_str()?;
    if mask.len() != 8 || !mask.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(mask, 16).ok()
}

/// Validates the `version_bits` field of a submission against the
/// session's granted mask. Bits outside the mask are a protocol
/// violation, not a share the pool should hash.
pub fn rolled_bits(bits: &str, mask: u32) -> Option<u32> {
    if bits.len() != 8 || !bits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let bits = u32::from_str_radix(bits, 16).ok()?;
    if bits & !mask != 0 {
        return None;
    }
    Some(bits)
}
