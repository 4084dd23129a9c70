//! Video decoding and plate crop extraction.

pub mod crop;
pub mod error;
pub mod frames;
#[cfg(feature = "native-decode")]
pub mod native;
pub mod probe;

pub use crop::{crop_from_frame, extract_crop, CropRejection};
pub use error::{MediaError, MediaResult};
pub use frames::Ffmpeg;
pub use probe::{probe_video, VideoInfo};
