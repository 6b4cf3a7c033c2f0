//! Metrics and observability infrastructure.
//!
//! - `events`: internal event types and the `InternalEvent` trait
//! - `server`: Prometheus HTTP server and initialization

pub mod events;
pub mod server;

pub use server::{DEFAULT_METRICS_ADDR, MetricsController, init_global, init_test};

/// Emit a metric event.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding Prometheus series.
///
/// ```ignore
/// use txstream_core::emit;
/// use txstream_core::metrics::events::RecordsPolled;
///
/// emit!(RecordsPolled { count: 3 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
