use ndarray::Array2;

/// Represents a single camera frame.
///
/// # Storage
/// Data is stored as a raw byte vector (`Vec<u8>`).
/// - 8-bit images: 1 byte per pixel.
/// - 12/16-bit images: 2 bytes per pixel, Little Endian.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Bits per pixel (e.g., 8, 12, 16)
    pub bit_depth: u32,

    /// Raw pixel data
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a new frame from 16-bit pixel data.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }

        Self {
            width,
            height,
            bit_depth: 16,
            data,
        }
    }

    /// Create a new frame from 8-bit pixel data.
    pub fn from_u8(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            bit_depth: 8,
            data,
        }
    }

    /// Number of pixels in the frame.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of the pixel buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Bytes per pixel implied by the bit depth.
    pub fn bytes_per_pixel(&self) -> usize {
        if self.bit_depth <= 8 {
            1
        } else {
            2
        }
    }

    /// Get pixel value at (x, y) as u32 (handling bit depth conversion).
    pub fn get(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let idx = (y * self.width + x) as usize;

        match self.bit_depth {
            8 => self.data.get(idx).map(|&v| v as u32),
            12 | 16 => {
                let start = idx * 2;
                if start + 1 < self.data.len() {
                    let bytes = [self.data[start], self.data[start + 1]];
                    Some(u16::from_le_bytes(bytes) as u32)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Iterate pixel intensities in row-major order.
    pub fn pixels(&self) -> Box<dyn Iterator<Item = f64> + '_> {
        let count = self.pixel_count();
        if self.bit_depth <= 8 {
            Box::new(self.data.iter().take(count).map(|&v| v as f64))
        } else {
            Box::new(
                self.data
                    .chunks_exact(2)
                    .take(count)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]) as f64),
            )
        }
    }

    /// Minimum and maximum intensity, or `None` for an empty frame.
    pub fn min_max(&self) -> Option<(f64, f64)> {
        self.pixels().fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }

    /// Calculate mean pixel value.
    pub fn mean(&self) -> f64 {
        let count = self.pixel_count();
        if count == 0 {
            return 0.0;
        }
        self.pixels().sum::<f64>() / count as f64
    }

    /// Frame as a `height x width` floating point array.
    pub fn to_array(&self) -> Array2<f64> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut values: Vec<f64> = self.pixels().collect();
        values.resize(w * h, 0.0);
        Array2::from_shape_vec((h, w), values).unwrap_or_else(|_| Array2::zeros((h, w)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteen_bit_pixels_are_little_endian() {
        let frame = Frame::from_u16(2, 2, &[1, 256, 65535, 7]);
        assert_eq!(frame.get(1, 0), Some(256));
        assert_eq!(frame.get(0, 1), Some(65535));
        assert_eq!(frame.get(2, 0), None);
        assert_eq!(frame.byte_len(), 8);
    }

    #[test]
    fn statistics() {
        let frame = Frame::from_u8(3, 1, vec![2, 4, 9]);
        assert_eq!(frame.min_max(), Some((2.0, 9.0)));
        assert!((frame.mean() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn to_array_is_row_major() {
        let frame = Frame::from_u16(3, 2, &[0, 1, 2, 3, 4, 5]);
        let arr = frame.to_array();
        assert_eq!(arr.dim(), (2, 3));
        assert_eq!(arr[[1, 0]], 3.0);
        assert_eq!(arr[[0, 2]], 2.0);
    }
}
