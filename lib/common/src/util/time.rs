use std::{
    fmt::Write,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Pretty-print the elapsed time (used in progress bars)
pub fn elapsed_subsec(state: &indicatif::ProgressState, writer: &mut dyn Write) {
    let seconds = state.elapsed().as_secs();
    let sub_seconds = (state.elapsed().as_millis() % 1000) / 100;
    let _ = writer.write_str(&format!("{}.{}s", seconds, sub_seconds));
}

/// Returns the current time in milliseconds since the UNIX epoch.
///
/// # Panics
///
/// Panics if the current time is before the UNIX epoch (i.e. if the system
/// clock is set incorrectly).
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

/// Milliseconds elapsed since `start_ms`, saturating at zero.
pub fn elapsed_ms_since(start_ms: u64) -> u64 {
    now_ms().saturating_sub(start_ms)
}

/// Pretty-print a duration for logs and diagnostics.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    let seconds = duration.as_secs();
    let minutes = seconds / 60;

    match minutes {
        0 => match seconds {
            0 => format!("{}ms", millis),
            _ => format!("{:.3}s", seconds as f64 + (millis % 1_000) as f64 / 1_000.0),
        },
        _ => format!("{:.3}m", minutes as f64 + (seconds % 60) as f64 / 60.0),
    }
}
