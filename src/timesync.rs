//! Coarse clock synchronization for sleepy nodes.
//!
//! Classic four-timestamp exchange: the node stamps `t1` into a
//! CLOCK_REQUEST, the gateway stamps receive (`t2`) and send (`t3`) times
//! into the CLOCK_RESPONSE, and the node stamps arrival (`t4`). Offset and
//! round trip fall out of the usual NTP formulas; millisecond accuracy is
//! plenty for scheduling wake windows.

/// Result of a completed clock-sync exchange. Microsecond units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSync {
    /// Gateway clock minus node clock.
    pub offset_us: i64,
    /// Network round trip with gateway processing time removed.
    pub round_trip_us: i64,
}

impl ClockSync {
    /// Evaluates the exchange from its four timestamps.
    pub fn evaluate(t1: u64, t2: u64, t3: u64, t4: u64) -> Self {
        let t1 = t1 as i64;
        let t2 = t2 as i64;
        let t3 = t3 as i64;
        let t4 = t4 as i64;
        Self {
            offset_us: ((t2 - t1) + (t3 - t4)) / 2,
            round_trip_us: (t4 - t1) - (t3 - t2),
        }
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_us / 1_000
    }
}

/// Serializes the CLOCK_REQUEST plaintext: `t1` little-endian.
pub fn encode_request(t1: u64) -> [u8; 8] {
    t1.to_le_bytes()
}

/// Parses the CLOCK_REQUEST plaintext.
pub fn decode_request(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Serializes the CLOCK_RESPONSE plaintext: `t1 ‖ t2 ‖ t3` little-endian.
pub fn encode_response(t1: u64, t2: u64, t3: u64) -> [u8; 24] {
    let mut out = [0u8; 24];
    out[..8].copy_from_slice(&t1.to_le_bytes());
    out[8..16].copy_from_slice(&t2.to_le_bytes());
    out[16..].copy_from_slice(&t3.to_le_bytes());
    out
}

/// Parses the CLOCK_RESPONSE plaintext.
pub fn decode_response(payload: &[u8]) -> Option<(u64, u64, u64)> {
    if payload.len() != 24 {
        return None;
    }
    let t1 = u64::from_le_bytes(payload[..8].try_into().ok()?);
    let t2 = u64::from_le_bytes(payload[8..16].try_into().ok()?);
    let t3 = u64::from_le_bytes(payload[16..].try_into().ok()?);
    Some((t1, t2, t3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_path_yields_exact_offset() {
        // Gateway clock runs 500ms ahead; 10ms each way; 2ms processing.
        let t1 = 1_000_000;
        let t2 = t1 + 500_000 + 10_000;
        let t3 = t2 + 2_000;
        let t4 = t1 + 10_000 + 2_000 + 10_000;
        let sync = ClockSync::evaluate(t1, t2, t3, t4);
        assert_eq!(sync.offset_us, 500_000);
        assert_eq!(sync.round_trip_us, 20_000);
        assert_eq!(sync.offset_ms(), 500);
    }

    #[test]
    fn negative_offset_when_node_runs_ahead() {
        let t1 = 2_000_000;
        let t2 = t1 - 300_000 + 5_000;
        let t3 = t2 + 1_000;
        let t4 = t1 + 11_000;
        let sync = ClockSync::evaluate(t1, t2, t3, t4);
        assert_eq!(sync.offset_us, -300_000);
        assert_eq!(sync.round_trip_us, 10_000);
    }

    #[test]
    fn request_response_round_trip() {
        assert_eq!(decode_request(&encode_request(42)), Some(42));
        assert_eq!(decode_request(&[0u8; 7]), None);
        assert_eq!(
            decode_response(&encode_response(1, 2, 3)),
            Some((1, 2, 3))
        );
        assert_eq!(decode_response(&[0u8; 23]), None);
    }
}
