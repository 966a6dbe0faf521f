//! Bus instance configuration.
//!
//! Options are plain deserializable data; loading them from a file or the
//! environment is the embedding application's concern.

use serde::Deserialize;

/// Tuning options for a bus instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusOptions {
    /// Buffer size for observer stream channels. `None` means unbounded.
    ///
    /// With a bounded buffer, delivery to a stream whose buffer is full
    /// drops that one value for that one observer (at-most-once for lagging
    /// readers); the observer stays subscribed.
    pub stream_capacity: Option<usize>,
    /// Log removed subscribers at `warn` (true) or `debug` (false).
    pub warn_on_subscriber_failure: bool,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            stream_capacity: None,
            warn_on_subscriber_failure: true,
        }
    }
}
