use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

/// Seconds between 1904-01-01 (the MP4 epoch) and 1970-01-01.
const MP4_EPOCH_OFFSET: u64 = 2_082_844_800;

pub fn mp4_timestamp(duration: Duration) -> u64 {
    duration.as_secs() + MP4_EPOCH_OFFSET
}

pub fn mp4_timestamp_now() -> u64 {
    mp4_timestamp(now())
}

fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Rescales `t` from `old_scale` ticks per second to `new_scale`.
pub fn convert_time(t: u64, old_scale: u32, new_scale: u32) -> Result<u64> {
    if old_scale == 0 {
        return Err(Error::invalid("time scale of 0"));
    }
    if old_scale == new_scale {
        return Ok(t);
    }
    let scaled = u128::from(t) * u128::from(new_scale) / u128::from(old_scale);
    u64::try_from(scaled).map_err(|_| Error::invalid(format!("time {t} overflows after rescaling")))
}
