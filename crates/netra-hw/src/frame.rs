//! Frame type, YUYV to RGB conversion and region crops.

/// A captured RGB8 video frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// 1-based capture order within the source.
    pub sequence: u64,
}

/// A rectangular RGB8 region copied out of a frame. May be empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Crop {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Crop {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }
}

impl Frame {
    /// Build a frame from packed RGB data, checking the buffer length.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self, FrameError> {
        let expected = rgb_len(width, height);
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
        })
    }

    /// RGB triple at (x, y). Caller guarantees bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    /// Copy the region `[left, right) x [top, bottom)` out of the frame.
    ///
    /// Coordinates are clamped to the frame; an inverted or fully
    /// out-of-frame region yields an empty crop.
    pub fn crop(&self, left: f32, top: f32, right: f32, bottom: f32) -> Crop {
        let clamp_x = |v: f32| v.floor().clamp(0.0, self.width as f32) as u32;
        let clamp_y = |v: f32| v.floor().clamp(0.0, self.height as f32) as u32;

        let (x0, x1) = (clamp_x(left), clamp_x(right));
        let (y0, y1) = (clamp_y(top), clamp_y(bottom));

        if x1 <= x0 || y1 <= y0 {
            return Crop {
                data: Vec::new(),
                width: 0,
                height: 0,
            };
        }

        let crop_w = (x1 - x0) as usize;
        let crop_h = (y1 - y0) as usize;
        let stride = self.width as usize * 3;
        let mut data = Vec::with_capacity(crop_w * crop_h * 3);
        for y in y0 as usize..y1 as usize {
            let start = y * stride + x0 as usize * 3;
            data.extend_from_slice(&self.data[start..start + crop_w * 3]);
        }

        Crop {
            data,
            width: crop_w as u32,
            height: crop_h as u32,
        }
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 full-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(rgb_len(width, height));
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push((y + 1.402 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344_136 * u - 0.714_136 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).round().clamp(0.0, 255.0) as u8);
        }
    }
    Ok(rgb)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
