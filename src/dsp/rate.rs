//! Sample rate negotiation
//!
//! The server can produce any rate we ask for, but we can only upsample by an
//! integer factor. The legal request rates are therefore the halvings of the
//! output device's native rate down to `MIN_REQUEST_RATE`.

use crate::constants::{ASSUMED_USEFUL_RATE, MIN_REQUEST_RATE};
use crate::error::ConfigError;

/// Every legal request rate for `native_rate`, highest first.
///
/// `native_rate / 2^k` for each k while the division is exact and the result
/// stays at or above `MIN_REQUEST_RATE`. A native rate below the floor yields
/// only itself.
pub fn legal_request_rates(native_rate: u32) -> Vec<u32> {
    let mut rates = vec![native_rate];
    let mut rate = native_rate;
    while rate % 2 == 0 && rate / 2 >= MIN_REQUEST_RATE {
        rate /= 2;
        rates.push(rate);
    }
    rates
}

/// Smallest exact divisor of `high_rate` that is still at least `low_rate`.
///
/// Returns `high_rate` unchanged when it is already below `low_rate` or when
/// `low_rate` is zero.
pub fn minimize_sample_rate(high_rate: u32, low_rate: u32) -> u32 {
    if low_rate == 0 || high_rate < low_rate {
        return high_rate;
    }
    let max_divisor = high_rate / low_rate;
    (1..=max_divisor)
        .rev()
        .find(|d| high_rate % d == 0)
        .map(|d| high_rate / d)
        .unwrap_or(high_rate)
}

/// Legal rate nearest to `preferred`; ties go to the higher rate.
pub fn snap_to_legal(native_rate: u32, preferred: u32) -> u32 {
    legal_request_rates(native_rate)
        .into_iter()
        .min_by_key(|&r| (r.abs_diff(preferred), u32::MAX - r))
        .unwrap_or(native_rate)
}

/// Choose the rate to request from the server.
///
/// Without a stored preference the default is `minimize_sample_rate(native, 40000)`,
/// which need not lie on the halving ladder. A stored preference is always
/// re-snapped against the current device, since it may come from another one.
pub fn pick_request_rate(native_rate: u32, preferred_rate: Option<u32>) -> u32 {
    let rate = match preferred_rate {
        Some(preferred) => snap_to_legal(native_rate, preferred),
        None => minimize_sample_rate(native_rate, ASSUMED_USEFUL_RATE),
    };

    if rate == 0 || native_rate % rate != 0 {
        debug_assert!(false, "request rate {} does not divide {}", rate, native_rate);
        tracing::error!(
            "Request rate {} does not divide native rate {}, requesting native rate",
            rate,
            native_rate
        );
        return native_rate;
    }
    rate
}

/// Upsampling factor from `stream_rate` to `native_rate`
pub fn interpolation_ratio(native_rate: u32, stream_rate: u32) -> Result<u32, ConfigError> {
    if stream_rate == 0 || native_rate % stream_rate != 0 {
        return Err(ConfigError::NonIntegerRatio {
            native_rate,
            stream_rate,
        });
    }
    Ok(native_rate / stream_rate)
}

/// Cutoff of the anti-imaging low-pass stage that follows zero-stuffing
pub fn antialias_cutoff_hz(stream_rate: u32, native_rate: u32) -> f32 {
    (stream_rate as f32 * 0.8).min(native_rate as f32 * 0.5)
}

/// Rate negotiation state for one output device
#[derive(Debug, Clone)]
pub struct RateNegotiator {
    native_rate: u32,
    requested_rate: u32,
}

impl RateNegotiator {
    pub fn new(native_rate: u32, preferred_rate: Option<u32>) -> Self {
        Self {
            native_rate,
            requested_rate: pick_request_rate(native_rate, preferred_rate),
        }
    }

    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    /// Rate currently requested from the server
    pub fn requested_rate(&self) -> u32 {
        self.requested_rate
    }

    /// All rates the user may choose from
    pub fn legal_rates(&self) -> Vec<u32> {
        legal_request_rates(self.native_rate)
    }

    /// Apply a new user preference; returns the snapped rate actually used
    pub fn set_preference(&mut self, preferred: u32) -> u32 {
        self.requested_rate = pick_request_rate(self.native_rate, Some(preferred));
        self.requested_rate
    }

    /// Ratio for an incoming stream, degrading to 1 when it does not divide evenly
    pub fn ratio_for(&self, stream_rate: u32) -> u32 {
        match interpolation_ratio(self.native_rate, stream_rate) {
            Ok(ratio) => ratio,
            Err(e) => {
                tracing::error!("{}; playing without upsampling", e);
                1
            }
        }
    }
}
