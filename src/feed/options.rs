/// Configuration for a feed.
///
/// Passed to the native engine on `create` and kept by the consumer for
/// its own drain and cache behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedOptions {
    /// Span records requested per native drain call.
    ///
    /// The drain buffer is allocated once at this size and reused.
    /// Default: 256. Zero is treated as 1.
    pub drain_capacity: usize,

    /// Materialize a chunk view as soon as `ChunkAdded` arrives.
    ///
    /// When false, only the declared size is recorded and the view is
    /// created the first time a span references the chunk.
    /// Default: true.
    pub eager_chunk_views: bool,

    /// Label used in log messages.
    pub name: String,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            drain_capacity: 256,
            eager_chunk_views: true,
            name: "feed".to_string(),
        }
    }
}

impl FeedOptions {
    pub fn with_drain_capacity(mut self, capacity: usize) -> Self {
        self.drain_capacity = capacity;
        self
    }

    pub fn with_eager_chunk_views(mut self, eager: bool) -> Self {
        self.eager_chunk_views = eager;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Capacity actually used for the drain buffer.
    #[inline]
    pub fn effective_capacity(&self) -> usize {
        self.drain_capacity.max(1)
    }
}
