use windows_sys::Win32::Media::{timeBeginPeriod, timeEndPeriod};

/// Matching the smallest period the multimedia timer supports.
const HIGH_RESOLUTION_PERIOD_MS: u32 = 1;

pub(crate) fn activate_high_resolution_timer(activate: bool) {
    // Each timeBeginPeriod must be balanced by a timeEndPeriod; the loop
    // toggles strictly, so the pairing holds.
    unsafe {
        if activate {
            timeBeginPeriod(HIGH_RESOLUTION_PERIOD_MS);
        } else {
            timeEndPeriod(HIGH_RESOLUTION_PERIOD_MS);
        }
    }
}
