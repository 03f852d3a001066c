//! C4 — Response Interpreters.
//!
//! Pulls structured fields out of the free-text `getver` response and the
//! SIM identifier out of either a direct ICCID line or three packed 64-bit
//! parameters. Mirrors `getver.go`/`iccid.go`'s regex choices exactly;
//! callers decide what to do with the result (cache write, emit
//! `device_update`), these functions only parse.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_VER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bver:([^\s]+(?:\s+Rev:?\s*\d+)?)").unwrap());
static RE_HW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bhw:([A-Za-z0-9_-]+)").unwrap());
static RE_IMEI: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bimei:([0-9]{14,17})").unwrap());

/// Fields extracted from a `getver` response. Any field may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub firmware: String,
    pub model: String,
    pub imei: String,
}

/// Parses a `getver` response text for firmware, hardware model and IMEI.
pub fn parse_getver(text: &str) -> VersionInfo {
    VersionInfo {
        firmware: RE_VER
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
        model: RE_HW
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
        imei: RE_IMEI
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
    }
}

/// Minimum accepted length for a SIM identifier (ICCID); shorter candidates
/// are discarded rather than overwriting a cached value.
pub const MIN_ICCID_LEN: usize = 18;

/// Extracts the ASCII decimal digits from the big-endian byte representation
/// of one packed 64-bit parameter. Non-digit bytes are treated as padding
/// and dropped.
pub fn decode_iccid_chunk(value: u64) -> String {
    value
        .to_be_bytes()
        .iter()
        .filter(|&&b| b.is_ascii_digit())
        .map(|&b| b as char)
        .collect()
}

/// Joins the three packed parameters (219, 220, 221, in that order) into one
/// candidate SIM identifier.
pub fn decode_iccid_parts(p219: u64, p220: u64, p221: u64) -> String {
    let mut out = decode_iccid_chunk(p219);
    out.push_str(&decode_iccid_chunk(p220));
    out.push_str(&decode_iccid_chunk(p221));
    out
}

/// Extracts a direct ICCID from a line containing `ICCID:` or `CCID:`.
///
/// Whitespace around the value is trimmed. Returns `None` when no such
/// marker is present or the extracted digits are shorter than
/// [`MIN_ICCID_LEN`].
pub fn parse_iccid_text(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let marker_pos = lower.find("iccid:").or_else(|| lower.find("ccid:"))?;
    let marker_len = if lower[marker_pos..].starts_with("iccid:") {
        "iccid:".len()
    } else {
        "ccid:".len()
    };
    let rest = text[marker_pos + marker_len..].trim();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() >= MIN_ICCID_LEN {
        Some(digits)
    } else {
        None
    }
}

/// Parses a `"Param values: 219:<u64>, 220:<u64>, 221:<u64>"` response into
/// the packed SIM identifier, applying the same length/acceptance rule as
/// [`parse_iccid_text`].
///
/// Field order in the text doesn't matter; all three of 219/220/221 must be
/// present and parse as `u64` or `None` is returned.
pub fn parse_iccid_packed(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let idx = lower.find("param values:")?;
    let rest = &text[idx + "param values:".len()..];

    let mut parts: std::collections::HashMap<u32, u64> = std::collections::HashMap::new();
    for chunk in rest.split(',') {
        let chunk = chunk.trim();
        let mut split = chunk.splitn(2, ':');
        let id = split.next()?.trim().parse::<u32>().ok()?;
        let val = split.next()?.trim().parse::<u64>().ok()?;
        parts.insert(id, val);
    }

    let p219 = *parts.get(&219)?;
    let p220 = *parts.get(&220)?;
    let p221 = *parts.get(&221)?;

    let iccid = decode_iccid_parts(p219, p220, p221);
    if iccid.len() >= MIN_ICCID_LEN {
        Some(iccid)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_getver_response() {
        let v = parse_getver("Ver:03.25.14 Rev:01 Hw:FMC125 IMEI:356307042441013");
        assert_eq!(v.firmware, "03.25.14 Rev:01");
        assert_eq!(v.model, "FMC125");
        assert_eq!(v.imei, "356307042441013");
    }

    #[test]
    fn parses_getver_missing_fields_as_empty() {
        let v = parse_getver("garbage response");
        assert_eq!(v, VersionInfo::default());
    }

    #[test]
    fn getver_is_case_insensitive() {
        let v = parse_getver("ver:01.00 hw:fmb920");
        assert_eq!(v.firmware, "01.00");
        assert_eq!(v.model, "fmb920");
    }

    #[test]
    fn parses_direct_iccid() {
        let got = parse_iccid_text("ICCID: 8952020924380762238").unwrap();
        assert_eq!(got, "8952020924380762238");
    }

    #[test]
    fn direct_iccid_rejects_short_value() {
        assert_eq!(parse_iccid_text("ICCID: 12345"), None);
    }

    #[test]
    fn direct_iccid_accepts_ccid_marker() {
        let got = parse_iccid_text("CCID:8952020924380762238").unwrap();
        assert_eq!(got, "8952020924380762238");
    }

    #[test]
    fn decodes_packed_chunk() {
        // "89520209" as ASCII bytes, read back as a big-endian u64.
        let value = u64::from_be_bytes(*b"89520209");
        assert_eq!(decode_iccid_chunk(value), "89520209");
    }

    #[test]
    fn decodes_packed_parts_in_order() {
        let p219 = u64::from_be_bytes(*b"89520209");
        let p220 = u64::from_be_bytes(*b"24380762");
        let p221 = u64::from_be_bytes(*b"23800000");
        assert_eq!(
            decode_iccid_parts(p219, p220, p221),
            "895202092438076223800000"
        );
    }

    #[test]
    fn parses_packed_param_response() {
        let p219 = u64::from_be_bytes(*b"89520209");
        let p220 = u64::from_be_bytes(*b"24380762");
        let p221 = u64::from_be_bytes(*b"23800000");
        let text = format!("Param values: 219:{p219}, 220:{p220}, 221:{p221}");
        let got = parse_iccid_packed(&text).unwrap();
        assert_eq!(got, "895202092438076223800000");
    }

    #[test]
    fn packed_param_response_missing_field_is_none() {
        assert_eq!(parse_iccid_packed("Param values: 219:1, 220:2"), None);
    }
}
