//! Digital coded exposure for event camera recordings.
//!
//! Events are loaded once into an [`EventStore`] (or pulled progressively by
//! a [`StreamIngestor`]), searched by time or event index through a
//! [`TimeIndex`], and exposed by [`ShutterCompute`]: every event inside the
//! resolved shutter window that passes the space and polarity filters is
//! weighted by a [`Contribution`] function and accumulated into an output
//! point set. [`pca::analyze`] then yields the principal axes of that set.
//!
//! # Example
//!
//! ```no_run
//! use dce_core::{analyze, open_path, Contribution, EventStore, HostBackend, LoadOptions, Scene, ShutterCompute};
//!
//! let mut source = open_path("recording.raw").unwrap();
//! let store = EventStore::load_source(&mut source, LoadOptions::default()).unwrap();
//! let scene = Scene::new(store);
//!
//! let mut compute = ShutterCompute::new(HostBackend::new());
//! compute.bind(scene.store().events()).unwrap();
//! let summary = compute
//!     .run(&scene.exposure_request(Contribution::default()))
//!     .unwrap();
//! println!("{} events exposed", summary.count);
//!
//! let axes = analyze(&compute.snapshot().unwrap()).unwrap();
//! println!("major axis {:?}", axes.axes[0]);
//! ```
//!
//! # Features
//!
//! - `gpu` (default): the wgpu backend in [`gpu`]. Without it only the
//!   rayon-based [`HostBackend`] is available.

pub mod config;
pub mod contribution;
pub mod export;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod host;
pub mod index;
pub mod pca;
pub mod scene;
pub mod shutter;
pub mod source;
pub mod store;
pub mod stream;
pub mod types;
pub mod window;

// Re-export commonly used types
pub use config::{ConfigError, ExposureConfig};
pub use contribution::Contribution;
pub use export::{OutputError, OutputFormat};
#[cfg(feature = "gpu")]
pub use gpu::WgpuBackend;
pub use host::HostBackend;
pub use index::{IndexError, TimeIndex};
pub use pca::{analyze, PcaError, PrincipalAxes};
pub use scene::{Scene, TimeDomain};
pub use shutter::{
    BackendError, ComputeBackend, ComputeError, ComputeOutput, ComputeSummary, ExposureRequest,
    ShutterCompute,
};
pub use source::{open_path, EventSource, SourceError};
pub use store::{EventStore, LoadOptions, StoreError};
pub use stream::{IngestState, StepOutcome, StepParams, StreamError, StreamIngestor};
pub use types::{BoundingVolume, Event, IndexRange, RawEvent, Resolution};
pub use window::{ShutterType, ShutterWindow, SpaceWindow, TimeUnit, WindowSpec};
