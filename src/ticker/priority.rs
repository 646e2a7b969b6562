//! Ticker scheduling priority
//!
//! Video tickers get an elevated but non-realtime class on constrained
//! mobile platforms and the realtime class elsewhere. Audio tickers honour
//! the `MS_AUDIO_PRIO` environment variable and otherwise use the platform
//! default.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TickerError;
use crate::stream::StreamKind;

/// Environment variable overriding the audio ticker priority
pub const AUDIO_PRIORITY_ENV: &str = "MS_AUDIO_PRIO";

/// OS scheduling class of a ticker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickerPriority {
    Normal,
    High,
    Realtime,
}

impl TickerPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickerPriority::Normal => "NORMAL",
            TickerPriority::High => "HIGH",
            TickerPriority::Realtime => "REALTIME",
        }
    }
}

impl fmt::Display for TickerPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TickerPriority {
    type Err = TickerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("NORMAL") {
            Ok(TickerPriority::Normal)
        } else if s.eq_ignore_ascii_case("HIGH") {
            Ok(TickerPriority::High)
        } else if s.eq_ignore_ascii_case("REALTIME") {
            Ok(TickerPriority::Realtime)
        } else {
            Err(TickerError::InvalidPriority(s.to_string()))
        }
    }
}

/// Default audio priority when nothing overrides it
pub fn platform_default_priority() -> TickerPriority {
    if cfg!(target_os = "linux") {
        TickerPriority::Realtime
    } else {
        TickerPriority::High
    }
}

/// Resolve an audio priority from an optional override value.
/// Invalid values are logged and fall back to the platform default
pub fn audio_priority_from(value: Option<&str>) -> TickerPriority {
    match value.map(str::parse::<TickerPriority>) {
        Some(Ok(priority)) => priority,
        Some(Err(e)) => {
            tracing::error!("{} ignored: {}", AUDIO_PRIORITY_ENV, e);
            platform_default_priority()
        }
        None => platform_default_priority(),
    }
}

/// Default ticker priority for a stream kind
pub fn default_priority(kind: StreamKind) -> TickerPriority {
    match kind {
        StreamKind::Video => {
            if cfg!(any(target_os = "ios", target_os = "android")) {
                TickerPriority::High
            } else {
                TickerPriority::Realtime
            }
        }
        StreamKind::Audio => {
            let value = std::env::var(AUDIO_PRIORITY_ENV).ok();
            audio_priority_from(value.as_deref())
        }
    }
}

/// Apply a priority class to the calling thread
pub fn apply_to_current_thread(priority: TickerPriority) -> Result<(), TickerError> {
    if priority == TickerPriority::Normal {
        return Ok(());
    }
    set_os_priority(priority)
}

#[cfg(target_os = "linux")]
fn set_os_priority(priority: TickerPriority) -> Result<(), TickerError> {
    let policy = match priority {
        TickerPriority::Realtime => libc::SCHED_FIFO,
        _ => libc::SCHED_RR,
    };

    let max = unsafe { libc::sched_get_priority_max(policy) };
    let param = libc::sched_param {
        sched_priority: max,
    };

    // Current thread (tid = 0)
    let result = unsafe { libc::sched_setscheduler(0, policy, &param) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        return Err(TickerError::Priority(format!(
            "sched_setscheduler failed: {} (hint: requires CAP_SYS_NICE or root)",
            err
        )));
    }
    Ok(())
}

#[cfg(windows)]
fn set_os_priority(priority: TickerPriority) -> Result<(), TickerError> {
    use windows::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_HIGHEST,
        THREAD_PRIORITY_TIME_CRITICAL,
    };

    let level = match priority {
        TickerPriority::Realtime => THREAD_PRIORITY_TIME_CRITICAL,
        _ => THREAD_PRIORITY_HIGHEST,
    };
    unsafe { SetThreadPriority(GetCurrentThread(), level) }
        .map_err(|e| TickerError::Priority(format!("SetThreadPriority failed: {}", e)))
}

#[cfg(not(any(target_os = "linux", windows)))]
fn set_os_priority(priority: TickerPriority) -> Result<(), TickerError> {
    tracing::debug!("Thread priority {} not supported on this platform", priority);
    Ok(())
}
