use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

const ENV_DEBUG: &str = "RIVULET_DEBUG";

/// Text of a panic payload, `panic!` with a message carries a `&str` or a `String`.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Logs a panic as one error event, with the backtrace only when RUST_BACKTRACE asks for it.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    let location = panic_info
        .location()
        .map(ToString::to_string)
        .unwrap_or_default();
    let payload = panic_message(panic_info.payload());

    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        tracing::error!(%location, payload, %backtrace, "Panicked");
    } else {
        tracing::error!(%location, payload, "Panicked");
    }
}

fn debug_mode() -> bool {
    std::env::var(ENV_DEBUG).is_ok_and(|v| v.eq_ignore_ascii_case("true"))
}

fn default_directive(debug_mode: bool) -> &'static str {
    if debug_mode { "debug" } else { "info" }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default level, `RIVULET_DEBUG=true`
/// switches from flattened JSON to human readable text at `debug`.
pub fn register() {
    let debug_mode = debug_mode();

    let filter = EnvFilter::builder()
        .with_default_directive(
            default_directive(debug_mode)
                .parse()
                .unwrap_or(Level::INFO.into()),
        )
        .from_env_lossy();

    let layer = if debug_mode {
        fmt::layer().boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(text.as_ref()), "boom");
        let owned: Box<dyn Any + Send> = Box::new(format!("bad record {}", 7));
        assert_eq!(panic_message(owned.as_ref()), "bad record 7");
        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(true), "debug");
        assert_eq!(default_directive(false), "info");
        for debug in [true, false] {
            let directive: std::result::Result<tracing_subscriber::filter::Directive, _> =
                default_directive(debug).parse();
            assert!(directive.is_ok());
        }
    }
}
