//! Duration parsing, monotonic time, and cancellable sleeping.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::StampedeError;

/// Default timeout applied to every blocking operation that does not carry
/// an explicit override (scripts, HTTP steps, rendezvous, worker RPC).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the process epoch. Monotonic — never goes
/// backwards even if the wall clock is adjusted.
pub fn monotonic_ms() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

/// Current wall-clock time as milliseconds since the Unix epoch. Used for
/// result timestamps and for the coordinator's synchronised start time.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parse a human duration string of the form `<number><unit>` where the unit
/// is one of `ms`, `s`, `m`, `h`. A bare number is interpreted as seconds.
///
/// ```
/// use stampede_core::clock::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, StampedeError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(StampedeError::Config(
            "duration string must not be empty".to_string(),
        ));
    }

    let unit_start = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num_part, unit_part) = s.split_at(unit_start);

    let value: f64 = num_part.parse().map_err(|_| {
        StampedeError::Config(format!("invalid duration: \"{input}\""))
    })?;
    if value < 0.0 {
        return Err(StampedeError::Config(format!(
            "duration must not be negative: \"{input}\""
        )));
    }

    let millis = match unit_part.trim() {
        "ms" => value,
        "s" | "" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        other => {
            return Err(StampedeError::Config(format!(
                "unknown duration unit \"{other}\" in \"{input}\""
            )))
        }
    };

    Ok(Duration::from_millis(millis.round() as u64))
}

/// Sleep for `duration`, returning early with [`StampedeError::Cancelled`]
/// when the token fires. Callers must propagate the cancellation error.
pub async fn sleep(duration: Duration, cancel: &CancellationToken) -> Result<(), StampedeError> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(StampedeError::Cancelled),
    }
}

/// Race `op` against a deadline. On expiry the future is dropped — which for
/// our operations aborts the underlying work (reqwest cancels the request,
/// channel waits unregister) — and a typed timeout error is returned.
pub async fn with_deadline<T, F>(op: F, deadline: Duration) -> Result<T, StampedeError>
where
    F: std::future::Future<Output = T>,
{
    match tokio::time::timeout(deadline, op).await {
        Ok(value) => Ok(value),
        Err(_) => Err(StampedeError::Timeout(deadline.as_millis() as u64)),
    }
}
