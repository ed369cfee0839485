//! Base image resolution
//!
//! The base layer is supplied by an external image service (pull, unpack,
//! cache). The lifecycle only needs the unpacked layer directory and its
//! digest; the base identifier comes from the project.

use crate::errors::ImageError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What an image service hands back for the project's base
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObtainedImage {
    /// Unpacked base layer directory
    pub base_layer_dir: PathBuf,
    /// Content digest of the base layer, e.g. `sha256:...`
    pub base_digest: String,
}

/// Resolved base image for one lifecycle run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseImageInfo {
    pub base_layer_dir: PathBuf,
    pub base_digest: String,
    /// Base identifier as written in the project, e.g. `ubuntu@24.04`
    pub base_identifier: String,
}

impl BaseImageInfo {
    pub fn new(image: ObtainedImage, base_identifier: impl Into<String>) -> Self {
        Self {
            base_layer_dir: image.base_layer_dir,
            base_digest: image.base_digest,
            base_identifier: base_identifier.into(),
        }
    }
}

/// Supplies the unpacked base layer
pub trait ImageService {
    /// Obtain (pull or reuse) the base image
    fn obtain_image(&self) -> std::result::Result<ObtainedImage, ImageError>;
}

pub mod mock {
    //! Fixed-answer image service for tests

    use super::{ImageService, ObtainedImage};
    use crate::errors::ImageError;
    use std::path::PathBuf;

    /// Image service returning a preconfigured image or failure
    #[derive(Debug, Clone)]
    pub struct StaticImageService {
        outcome: std::result::Result<ObtainedImage, (String, String)>,
    }

    impl StaticImageService {
        /// Always return the given layer directory and digest
        pub fn new(base_layer_dir: impl Into<PathBuf>, base_digest: impl Into<String>) -> Self {
            Self {
                outcome: Ok(ObtainedImage {
                    base_layer_dir: base_layer_dir.into(),
                    base_digest: base_digest.into(),
                }),
            }
        }

        /// Always fail to resolve `base`
        pub fn failing(base: impl Into<String>, reason: impl Into<String>) -> Self {
            Self {
                outcome: Err((base.into(), reason.into())),
            }
        }
    }

    impl ImageService for StaticImageService {
        fn obtain_image(&self) -> std::result::Result<ObtainedImage, ImageError> {
            self.outcome
                .clone()
                .map_err(|(base, reason)| ImageError::BaseResolution { base, reason })
        }
    }
}
