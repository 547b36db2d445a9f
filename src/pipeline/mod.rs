//! External collaborators of the extraction engine.
//!
//! The orchestrator depends on three traits: [`render::DocumentSource`],
//! [`vision::VisionModel`] and [`crop::Cropper`]. Everything in here is the
//! default implementation of one of them, or a helper they share. Swapping
//! one out (a different renderer, a fake model in tests) never touches the
//! phase logic.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ vision ──▶ schema ──▶ (phases) ──▶ crop
//! (URL/path) (pdfium)  (base64)   (VLM)      (serde)                 (PNG)
//! ```
//!
//! 1. [`input`]: canonicalise the submitted path, URL or bytes to a local file
//! 2. [`render`]: rasterise pages and read their text layer in `spawn_blocking`
//! 3. [`encode`]: PNG-encode pages for the model and crops for storage
//! 4. [`vision`]: one timed, single-attempt model call per request
//! 5. [`schema`]: decode loose model JSON into fixed types
//! 6. [`crop`]: cut linked diagrams out of the page raster

pub mod crop;
pub mod encode;
pub mod input;
pub mod render;
pub mod schema;
pub mod vision;
