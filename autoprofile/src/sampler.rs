use std::time::Duration;

use crate::error::Result;
use crate::profile::Profile;

/// Capture capability for one resource kind.
///
/// A sampler is owned by exactly one scheduler, which serializes every call
/// into it, so implementations need no internal locking.
pub trait Sampler: Send {
    /// Clears anything accumulated so far. Called before first use and after
    /// every report.
    fn reset(&mut self);

    /// Opens a capture window.
    fn start(&mut self) -> Result<()>;

    /// Closes the capture window opened by [`Sampler::start`].
    fn stop(&mut self) -> Result<()>;

    /// Builds a profile from everything captured since the last reset.
    ///
    /// Must cope with nothing having been captured, and with `start`/`stop`
    /// never having succeeded.
    fn build_profile(&mut self, duration: Duration, timespan: Duration) -> Result<Profile>;
}
