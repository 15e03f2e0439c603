//! Output pictures: client textures paired with driver readback images.
//!
//! One [`OutputPicture`] exists per picture buffer the client assigned.  The
//! cache also keeps the FIFO of pictures the client has finished displaying;
//! the client thread pairs the head of that queue with the head of the
//! pending-output queue.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};

use vadec_core::client::RenderContext;
use vadec_core::error::{DecoderError, Result};
use vadec_core::surface::Surface;
use vadec_core::types::{PictureBuffer, Size};
use vadec_vaapi::context::VaapiContext;
use vadec_vaapi::driver::VaImage;

/// A client texture bound to an RGBX image the decoded surface is read into.
#[derive(Debug)]
pub(crate) struct OutputPicture {
    pub picture_buffer_id: i32,
    pub texture_id: u32,
    pub size: Size,
    image: VaImage,
}

impl OutputPicture {
    /// Read `surface` back and upload its pixels into the bound texture.
    ///
    /// Blocks until the hardware has finished decoding into `surface`.
    pub fn upload(
        &self,
        hw: &VaapiContext,
        render: &mut dyn RenderContext,
        surface: &Surface,
    ) -> Result<()> {
        if !render.make_context_current() {
            return Err(DecoderError::Platform(
                "failed to make the render context current".into(),
            ));
        }
        hw.put_surface_into_image(surface.id(), &self.image)?;
        let mapped = hw.map_image(&self.image)?;
        let uploaded = render.upload_rgbx(self.texture_id, self.size, mapped.pitch(), &mapped);
        mapped.unmap()?;
        uploaded
    }
}

#[derive(Debug, Default)]
pub(crate) struct OutputPictureCache {
    pictures: BTreeMap<i32, OutputPicture>,
    free: VecDeque<i32>,
}

impl OutputPictureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create one picture per buffer, all initially free in the given order.
    ///
    /// All-or-nothing: on any failure the images created so far are destroyed
    /// and the cache is left untouched.
    pub fn create_batch(
        &mut self,
        hw: &VaapiContext,
        buffers: &[PictureBuffer],
        size: Size,
    ) -> Result<()> {
        if !self.pictures.is_empty() {
            return Err(DecoderError::IllegalState(format!(
                "{} output pictures still exist",
                self.pictures.len()
            )));
        }

        let mut batch: BTreeMap<i32, OutputPicture> = BTreeMap::new();
        let mut order = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            if batch.contains_key(&buffer.id) {
                destroy_images(hw, batch.values());
                return Err(DecoderError::InvalidArgument(format!(
                    "picture buffer id {} assigned twice",
                    buffer.id
                )));
            }
            let image = match hw.create_rgb_image(size) {
                Ok(image) => image,
                Err(e) => {
                    destroy_images(hw, batch.values());
                    return Err(e);
                }
            };
            batch.insert(
                buffer.id,
                OutputPicture {
                    picture_buffer_id: buffer.id,
                    texture_id: buffer.texture_id,
                    size,
                    image,
                },
            );
            order.push(buffer.id);
        }

        debug!(count = batch.len(), size = %size, "Created output pictures");
        self.pictures = batch;
        self.free = order.into();
        Ok(())
    }

    /// Destroy every picture, returning the ids in ascending order.
    pub fn destroy_all(&mut self, hw: &VaapiContext) -> Vec<i32> {
        self.free.clear();
        let pictures = std::mem::take(&mut self.pictures);
        destroy_images(hw, pictures.values());
        pictures.into_keys().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pictures.is_empty()
    }

    /// Number of pictures not currently held by the client.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Mark a picture as available for output.  Returns `false` for ids not
    /// in the current set and for pictures that are already free.
    pub fn push_free(&mut self, id: i32) -> bool {
        if !self.pictures.contains_key(&id) {
            return false;
        }
        if self.free.contains(&id) {
            warn!(picture_buffer_id = id, "Picture buffer reused while already free");
            return false;
        }
        self.free.push_back(id);
        true
    }

    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    /// Take the oldest free picture.
    pub fn pop_free(&mut self) -> Option<&OutputPicture> {
        let id = self.free.pop_front()?;
        self.pictures.get(&id)
    }
}

fn destroy_images<'a>(hw: &VaapiContext, pictures: impl Iterator<Item = &'a OutputPicture>) {
    for picture in pictures {
        hw.destroy_image(&picture.image);
    }
}
