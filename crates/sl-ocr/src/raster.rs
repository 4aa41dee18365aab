// SPDX-License-Identifier: MIT OR Apache-2.0
//! The rasterization seam.
//!
//! Blob formats belong to the file-storage collaborator; the pipeline only
//! needs page images for the vision tier. The pass-through implementation
//! forwards image uploads as a single page and rejects formats it cannot
//! page.

use sl_error::{CoreError, CoreResult};
use sl_llm::PageImage;

/// Turns an uploaded blob into a bounded set of page images.
pub trait Rasterizer: Send + Sync {
    /// Rasterize up to `max_pages` pages at up to `max_dpi`.
    fn rasterize(
        &self,
        blob: &[u8],
        mime_type: &str,
        max_pages: usize,
        max_dpi: u32,
    ) -> CoreResult<Vec<PageImage>>;
}

/// Forwards `image/*` blobs untouched; anything else must arrive
/// pre-rasterized or text-bearing.
#[derive(Debug, Default)]
pub struct PassthroughRasterizer;

impl Rasterizer for PassthroughRasterizer {
    fn rasterize(
        &self,
        blob: &[u8],
        mime_type: &str,
        _max_pages: usize,
        _max_dpi: u32,
    ) -> CoreResult<Vec<PageImage>> {
        if mime_type.starts_with("image/") {
            return Ok(vec![PageImage {
                bytes: blob.to_vec(),
                mime: mime_type.to_string(),
            }]);
        }
        Err(CoreError::validation(format!(
            "cannot rasterize {mime_type}; upload an image or a text-bearing file"
        )))
    }
}

/// Test rasterizer producing a configurable number of blank pages.
#[derive(Debug)]
pub struct FixedPageRasterizer {
    /// Pages produced per call, before the `max_pages` bound.
    pub pages: usize,
}

impl Rasterizer for FixedPageRasterizer {
    fn rasterize(
        &self,
        _blob: &[u8],
        _mime_type: &str,
        max_pages: usize,
        _max_dpi: u32,
    ) -> CoreResult<Vec<PageImage>> {
        Ok((0..self.pages.min(max_pages))
            .map(|_| PageImage {
                bytes: vec![0u8; 16],
                mime: "image/png".into(),
            })
            .collect())
    }
}
