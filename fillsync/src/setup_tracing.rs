use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

const ENV_DEBUG: &str = "FILLSYNC_DEBUG";

/// How log lines are rendered and which level applies when `RUST_LOG` is not set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogSettings {
    text: bool,
    default_level: Level,
}

impl LogSettings {
    /// `FILLSYNC_DEBUG=true` (any case) switches to plain text at `debug`, anything else keeps
    /// flattened JSON at `info`.
    fn from_debug_flag(flag: Option<&str>) -> Self {
        let debug = flag.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        Self {
            text: debug,
            default_level: if debug { Level::DEBUG } else { Level::INFO },
        }
    }

    fn from_env() -> Self {
        Self::from_debug_flag(std::env::var(ENV_DEBUG).ok().as_deref())
    }
}

fn panic_payload<'a>(panic_info: &'a PanicHookInfo<'_>) -> Option<&'a str> {
    let payload = panic_info.payload();
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

/// Logs a panic as a single `tracing` error event, `file:line:column: message`, unless a
/// backtrace was captured.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // captured only with RUST_BACKTRACE or RUST_LIB_BACKTRACE set
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        tracing::error!("{}\n{}", panic_info, backtrace);
        return;
    }

    match (panic_info.location(), panic_payload(panic_info)) {
        (Some(location), Some(payload)) => tracing::error!(
            "{}:{}:{}: {}",
            location.file(),
            location.line(),
            location.column(),
            payload,
        ),
        _ => tracing::error!("{}", panic_info),
    }
}

/// Installs the global subscriber and the panic hook. `RUST_LOG` overrides the default level.
///
/// Safe to call more than once, only the first call installs anything.
pub fn register() {
    let settings = LogSettings::from_env();

    let filter = EnvFilter::builder()
        .with_default_directive(settings.default_level.into())
        .from_env_lossy();

    let layer = if settings.text {
        fmt::layer().boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    if tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_ok()
    {
        std::panic::set_hook(Box::new(report_panic));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flag_selects_text_at_debug() {
        for flag in ["true", "TRUE", " True "] {
            assert_eq!(
                LogSettings::from_debug_flag(Some(flag)),
                LogSettings {
                    text: true,
                    default_level: Level::DEBUG
                }
            );
        }
    }

    #[test]
    fn test_json_at_info_otherwise() {
        let json = LogSettings {
            text: false,
            default_level: Level::INFO,
        };
        assert_eq!(LogSettings::from_debug_flag(None), json);
        assert_eq!(LogSettings::from_debug_flag(Some("1")), json);
        assert_eq!(LogSettings::from_debug_flag(Some("false")), json);
    }
}
