///
/// Multi-consumer event fan out used by the state tracker and the caches.
///
pub mod listeners;
