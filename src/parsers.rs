//! Filename parsing (C4), grounded in `aux_utils`'s filename-convention
//! parsers from `original_source/`.
//!
//! These are pure functions: no I/O, no catalog access. Each parser reads
//! `(slice_idx, time_idx, pos_idx, channel_name)` out of a plane file name;
//! `channel_idx` is not decided by the parser itself (§4.4) — channel names
//! are only numbered once every plane of a dataset has been seen, so that
//! the final assignment is alphabetical rather than first-seen order (see
//! `ChannelNameAccumulator`).

use std::sync::OnceLock;

use regex::Regex;

use crate::error::IngestError;

/// What a single filename parse yields before the dataset-wide channel
/// numbering pass runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedFrameName {
    pub channel_name: String,
    pub slice_idx: i64,
    pub time_idx: i64,
    pub pos_idx: i64,
}

fn sms_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^img_(?P<channel>.+)_t(?P<t>\d+)_p(?P<p>\d+)_z(?P<z>\d+)\.tif$").expect("static regex is valid")
    })
}

/// `parse_sms_name` (§4.4): `img_<channel>_t<TTT>_p<PPP>_z<ZZZ>.tif`.
/// `channel` may itself contain underscores, so it is matched greedily up
/// to the mandatory `_t###_p###_z###.tif` suffix.
pub fn parse_sms_name(file_name: &str) -> Result<ParsedFrameName, IngestError> {
    let caps = sms_name_re().captures(file_name).ok_or_else(|| IngestError::ParseError {
        name: file_name.to_string(),
        reason: "expected img_<channel>_t###_p###_z###.tif".to_string(),
    })?;
    let idx = |key: &str| -> Result<i64, IngestError> {
        caps.name(key)
            .expect("group is mandatory in the pattern")
            .as_str()
            .parse()
            .map_err(|_| IngestError::ParseError { name: file_name.to_string(), reason: format!("`{key}` index overflowed") })
    };
    Ok(ParsedFrameName {
        channel_name: caps["channel"].to_string(),
        time_idx: idx("t")?,
        pos_idx: idx("p")?,
        slice_idx: idx("z")?,
    })
}

fn idx_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^im_c(?P<c>\d+)_z(?P<z>\d+)_t(?P<t>\d+)_p(?P<p>\d+)\.(?P<ext>[A-Za-z0-9]+)$")
            .expect("static regex is valid")
    })
}

/// A plane name already bearing its own canonical channel index, with no
/// numbering pass required.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameName {
    pub channel_idx: i64,
    pub slice_idx: i64,
    pub time_idx: i64,
    pub pos_idx: i64,
}

/// `parse_idx_from_name` (§4.4): `im_c<CCC>_z<ZZZ>_t<TTT>_p<PPP>.<ext>`.
/// `channel_name` is the decimal `CCC` as a string — the index is already
/// canonical, so unlike `parse_sms_name` there is nothing to number later.
pub fn parse_idx_from_name(file_name: &str) -> Result<FrameName, IngestError> {
    let caps = idx_name_re().captures(file_name).ok_or_else(|| IngestError::ParseError {
        name: file_name.to_string(),
        reason: "expected im_c###_z###_t###_p###.<ext>".to_string(),
    })?;
    let idx = |key: &str| -> Result<i64, IngestError> {
        caps.name(key)
            .expect("group is mandatory in the pattern")
            .as_str()
            .parse()
            .map_err(|_| IngestError::ParseError { name: file_name.to_string(), reason: format!("`{key}` index overflowed") })
    };
    Ok(FrameName { channel_idx: idx("c")?, slice_idx: idx("z")?, time_idx: idx("t")?, pos_idx: idx("p")? })
}

/// Renders the canonical plane file name for a set of dimension indices
/// (§3.3 invariant 6, §6).
pub fn render_frame_name(channel_idx: i64, slice_idx: i64, time_idx: i64, pos_idx: i64, ext: &str) -> String {
    format!("im_c{channel_idx:03}_z{slice_idx:03}_t{time_idx:03}_p{pos_idx:03}.{ext}")
}

/// Accumulates distinct channel names observed while scanning a dataset's
/// planes and assigns final indices alphabetically once the scan is done
/// (§4.4, §9 "shared mutable accumulator for channel naming"). Assignment
/// only becomes stable after `finalize`; index lookups before that point
/// would not reflect the final alphabetical order.
#[derive(Debug, Default)]
pub struct ChannelNameAccumulator {
    seen: std::collections::BTreeSet<String>,
}

impl ChannelNameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, name: &str) {
        self.seen.insert(name.to_string());
    }

    /// Consumes the accumulator and returns the alphabetically sorted
    /// channel name list together with a lookup from name to its final
    /// index.
    pub fn finalize(self) -> ChannelNumbering {
        let names: Vec<String> = self.seen.into_iter().collect();
        ChannelNumbering { names }
    }
}

/// The stable result of a `ChannelNameAccumulator::finalize` call.
#[derive(Debug, Clone)]
pub struct ChannelNumbering {
    names: Vec<String>,
}

impl ChannelNumbering {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Index of `name` in the final alphabetical ordering. Panics if `name`
    /// was never `observe`d — callers only look up names they themselves
    /// fed in during the scan.
    pub fn index_of(&self, name: &str) -> i64 {
        self.names
            .iter()
            .position(|n| n == name)
            .expect("channel name must have been observed before finalize") as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_idx_named_plane() {
        let parsed = parse_idx_from_name("im_c001_z002_t000_p003.png").unwrap();
        assert_eq!(parsed, FrameName { channel_idx: 1, slice_idx: 2, time_idx: 0, pos_idx: 3 });
    }

    #[test]
    fn rejects_malformed_idx_name() {
        assert!(parse_idx_from_name("frame0001.png").is_err());
    }

    #[test]
    fn render_round_trips_with_parse() {
        let name = render_frame_name(2, 1, 0, 5, "png");
        let parsed = parse_idx_from_name(&name).unwrap();
        assert_eq!((parsed.channel_idx, parsed.slice_idx, parsed.time_idx, parsed.pos_idx), (2, 1, 0, 5));
    }

    #[test]
    fn parses_sms_name_with_underscored_channel() {
        let parsed = parse_sms_name("img_phase_contrast_t000_p050_z001.tif").unwrap();
        assert_eq!(parsed.channel_name, "phase_contrast");
        assert_eq!((parsed.time_idx, parsed.pos_idx, parsed.slice_idx), (0, 50, 1));
    }

    #[test]
    fn rejects_malformed_sms_name() {
        assert!(parse_sms_name("image001.tif").is_err());
    }

    #[test]
    fn channel_numbering_is_alphabetical_not_first_seen() {
        let mut acc = ChannelNameAccumulator::new();
        acc.observe("phase");
        acc.observe("brightfield");
        acc.observe("666");
        let numbering = acc.finalize();
        assert_eq!(numbering.names(), &["666".to_string(), "brightfield".to_string(), "phase".to_string()]);
        assert_eq!(numbering.index_of("666"), 0);
        assert_eq!(numbering.index_of("brightfield"), 1);
        assert_eq!(numbering.index_of("phase"), 2);
    }
}
