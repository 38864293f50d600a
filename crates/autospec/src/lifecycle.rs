//! Event Bus & Lifecycle Wrapper (C9): the single entry point every
//! CLI command runs through, emitting `command.start`/`command.complete`
//! and recovering panics as errors (§4.9).

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use autospec_core::error::{AutospecError, Result};
use autospec_core::events::{Event, EventBus, EventType};
use futures::FutureExt;

/// Run `fn_` under the lifecycle wrapper: stamp a start time, publish
/// `command.start`, await the future, publish `command.complete` (or
/// `error`), and return its result. A panic inside `fn_` is caught,
/// turned into an `AutospecError`, published as an `error` event, and
/// then re-raised so the process still aborts loudly.
pub async fn run_command<F, Fut>(name: &str, events: &EventBus, fn_: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let started = Instant::now();
    events.publish(Event::new(EventType::CommandStart, name)).await;

    let result = AssertUnwindSafe(fn_()).catch_unwind().await;

    let panicked = result.is_err();
    let outcome = result.unwrap_or_else(|panic| {
        Err(AutospecError::IoFailure(format!(
            "command '{name}' panicked: {}",
            panic_message(&panic)
        )))
    });

    match &outcome {
        Ok(()) => {
            events
                .publish(
                    Event::new(EventType::CommandComplete, name)
                        .with_success(true)
                        .with_duration(started.elapsed()),
                )
                .await;
        }
        Err(err) => {
            events
                .publish(
                    Event::new(EventType::Error, name)
                        .with_success(false)
                        .with_error(err.to_string())
                        .with_duration(started.elapsed()),
                )
                .await;
        }
    }

    // Re-raise panics rather than swallow them: a caught panic still
    // indicates the process is in a state a caller should not trust.
    if panicked {
        let message = outcome.err().map(|e| e.to_string()).unwrap_or_default();
        std::panic::resume_unwind(Box::new(message));
    }

    outcome
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_publishes_start_and_complete() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();
        run_command("specify", &bus, || async { Ok(()) }).await.unwrap();
        let start = rx.recv().await.unwrap();
        assert_eq!(start.event_type as u8, EventType::CommandStart as u8);
        let complete = rx.recv().await.unwrap();
        assert_eq!(complete.event_type as u8, EventType::CommandComplete as u8);
        assert_eq!(complete.success, Some(true));
    }

    #[tokio::test]
    async fn failure_publishes_error_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();
        let result = run_command("plan", &bus, || async {
            Err(AutospecError::AgentFailed("boom".to_string()))
        })
        .await;
        assert!(result.is_err());
        let _start = rx.recv().await.unwrap();
        let error = rx.recv().await.unwrap();
        assert_eq!(error.event_type as u8, EventType::Error as u8);
    }
}
