/// Crate-wide result alias.
///
/// Application-level failures are propagated as `anyhow::Error`; remote queue
/// operations deliberately do NOT use this alias and return plain outcome
/// values instead (see `queue::OpResult`).
pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
