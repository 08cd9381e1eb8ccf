//! Seams between the growth-rate core and its external collaborators.
//!
//! The persisted key-value cache and the pub/sub bus are implemented
//! elsewhere; the core only talks to them through these traits.
pub mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};

/// Experiment-scoped key-value cache (e.g. `od_filtered[experiment]`).
///
/// Values are opaque strings; callers choose the encoding.
pub trait KeyValueStore {
    fn get(
        &self,
        cache: &str,
        key: &str,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>>;

    fn set(
        &mut self,
        cache: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Outbound message bus.
pub trait Publisher {
    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Box<T> {
    fn get(
        &self,
        cache: &str,
        key: &str,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        (**self).get(cache, key)
    }

    fn set(
        &mut self,
        cache: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).set(cache, key, value)
    }
}

impl<T: Publisher + ?Sized> Publisher for Box<T> {
    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).publish(topic, payload)
    }
}
