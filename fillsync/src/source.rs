//! The polling-only data source the phases read from.

use crate::datapoint::{Entity, SourceData};
use crate::error::FetchError;
use crate::window::Window;

/// Bounded historical and "latest value" queries against the external source. Every transport
/// failure is folded into a [FetchError] so the phases only reason about transient vs permanent.
///
/// A query may answer with more keys than were asked for (a production counter together with its
/// good-count, a planned status together with the actual status). Every returned key is treated
/// as an entity of its own.
#[trait_variant::make(SourceClient: Send)]
pub trait LocalSourceClient {
    /// Points of `entity` (and its related keys) inside `[window.start, window.end)`.
    async fn query_window(&self, entity: &str, window: Window) -> Result<SourceData, FetchError>;

    /// Newest value of `elements` for each of `entities`.
    async fn query_latest(
        &self,
        entities: &[Entity],
        elements: &[String],
    ) -> Result<SourceData, FetchError>;
}
