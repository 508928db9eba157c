pub mod capture;
pub mod memory;
pub mod pagination;
pub mod performance;
pub mod ring_buffer;

pub use capture::{BufferPositions, CaptureStore, TelemetryKind, TrackingStatus};
pub use memory::MemoryPressure;
pub use pagination::{filter_scope, paginate, Cursor, Page, PageMetadata, PageRequest};
pub use performance::PerformanceStore;
pub use ring_buffer::{BufferSnapshot, RingBuffer};
