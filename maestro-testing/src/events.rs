//! ABOUTME: Event-capture helpers for integration tests
//! ABOUTME: Drains a subscription until the terminal event arrives

use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use maestro_events::BusEvent;

/// Collect events until a terminal event arrives (inclusive) or the
/// timeout elapses. Returns whatever was captured either way.
pub async fn collect_until_terminal(
    mut receiver: UnboundedReceiver<BusEvent>,
    timeout: Duration,
) -> Vec<BusEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::select! {
            event = receiver.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => break,
        };
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}
