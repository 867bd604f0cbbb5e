//! H.264 Annex-B helpers
//!
//! Splits encoder access units into parameter sets and picture data.

/// NAL unit types of interest
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// An access unit split by role
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SplitUnit {
    /// SPS/PPS NAL units, start codes included
    pub parameter_sets: Vec<u8>,
    /// Remaining NAL units, start codes included
    pub picture: Vec<u8>,
    /// Picture data contains an IDR slice
    pub is_idr: bool,
}

/// Byte ranges of each NAL unit (start code included)
fn nal_ranges(data: &[u8]) -> Vec<(usize, usize, usize)> {
    // (unit_start, payload_start, end)
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                let unit_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
                starts.push((unit_start, i + 3));
                i += 3;
                continue;
            }
        }
        i += 1;
    }

    let mut ranges = Vec::with_capacity(starts.len());
    for (idx, &(unit_start, payload_start)) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).map(|s| s.0).unwrap_or(data.len());
        ranges.push((unit_start, payload_start, end));
    }
    ranges
}

/// Type of the NAL unit whose header byte is `header`
pub fn nal_type(header: u8) -> u8 {
    header & 0x1F
}

/// Split an Annex-B access unit
pub fn split_access_unit(data: &[u8]) -> SplitUnit {
    let mut out = SplitUnit::default();
    let ranges = nal_ranges(data);
    if ranges.is_empty() {
        out.picture.extend_from_slice(data);
        return out;
    }
    for (unit_start, payload_start, end) in ranges {
        let Some(&header) = data.get(payload_start) else {
            continue;
        };
        let unit = &data[unit_start..end];
        match nal_type(header) {
            NAL_SPS | NAL_PPS => out.parameter_sets.extend_from_slice(unit),
            t => {
                if t == NAL_IDR {
                    out.is_idr = true;
                }
                out.picture.extend_from_slice(unit);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_parameter_sets_from_idr() {
        let au = [
            0, 0, 0, 1, 0x67, 0xAA, // SPS
            0, 0, 0, 1, 0x68, 0xBB, // PPS
            0, 0, 1, 0x65, 0xCC, 0xDD, // IDR
        ];
        let split = split_access_unit(&au);
        assert_eq!(split.parameter_sets, vec![0, 0, 0, 1, 0x67, 0xAA, 0, 0, 0, 1, 0x68, 0xBB]);
        assert_eq!(split.picture, vec![0, 0, 1, 0x65, 0xCC, 0xDD]);
        assert!(split.is_idr);
    }

    #[test]
    fn delta_unit_has_no_parameter_sets() {
        let au = [0, 0, 0, 1, 0x41, 0x01, 0x02];
        let split = split_access_unit(&au);
        assert!(split.parameter_sets.is_empty());
        assert!(!split.is_idr);
        assert_eq!(split.picture, au.to_vec());
    }

    #[test]
    fn data_without_start_codes_is_picture() {
        let split = split_access_unit(&[1, 2, 3]);
        assert_eq!(split.picture, vec![1, 2, 3]);
        assert!(split.parameter_sets.is_empty());
    }
}
