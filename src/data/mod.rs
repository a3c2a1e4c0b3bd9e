/// Data layer: metadata types, loading, snapshots and filtering.
///
/// Architecture:
/// ```text
///  image.tiff + image.tiff.json / metadata.csv
///        │
///        ▼
///   ┌──────────┐
///   │ snapshot  │  list dirs, read sidecars (loader) and pixels
///   └──────────┘
///        │
///        ▼
///   ┌────────────┐
///   │ ImageBatch  │  Vec<ImageRecord>, acquisition window
///   └────────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  filter   │  signature predicates → compatible indices
///   └──────────┘
/// ```

pub mod filter;
pub mod loader;
pub mod model;
pub mod snapshot;
