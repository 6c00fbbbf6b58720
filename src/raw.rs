//! Decoding of raw radiometric payloads into sensor counts.
//!
//! A payload is a flat buffer of `width * height` samples, row
//! major, each `sample_bytes` wide. The byte order is a property
//! of the capture format, never of the host: a big-endian payload
//! is byte-swapped sample by sample on every platform.
use std::io::Cursor;

use byteordered::{ByteOrdered, Endianness};
use ndarray::{Array2, ArrayView2};

use crate::error::{Error, Result};

/// Byte order of the samples in a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl From<ByteOrder> for Endianness {
    fn from(order: ByteOrder) -> Self {
        match order {
            ByteOrder::Little => Endianness::Little,
            ByteOrder::Big => Endianness::Big,
        }
    }
}

/// Declared shape of a raw payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawLayout {
    pub width: usize,
    pub height: usize,
    pub sample_bytes: usize,
    pub byte_order: ByteOrder,
}

impl RawLayout {
    pub fn u16(width: usize, height: usize, byte_order: ByteOrder) -> Self {
        RawLayout {
            width,
            height,
            sample_bytes: 2,
            byte_order,
        }
    }

    /// Payload length in bytes, `None` if it overflows `usize`.
    pub fn expected_len(&self) -> Option<usize> {
        self.width
            .checked_mul(self.height)?
            .checked_mul(self.sample_bytes)
    }
}

/// Immutable grid of raw sensor counts.
///
/// Indexed as `(row, col)` internally; the public accessors
/// take `(x, y)` pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct IntensityMatrix {
    samples: Array2<u16>,
}

impl IntensityMatrix {
    pub fn from_shape_vec(width: usize, height: usize, samples: Vec<u16>) -> Result<Self> {
        let invalid = |samples: usize| Error::InvalidShape {
            width,
            height,
            samples,
        };
        if width.checked_mul(height) != Some(samples.len()) {
            return Err(invalid(samples.len()));
        }
        let len = samples.len();
        let samples =
            Array2::from_shape_vec((height, width), samples).map_err(|_| invalid(len))?;
        Ok(IntensityMatrix { samples })
    }

    pub fn from_array(samples: Array2<u16>) -> Self {
        IntensityMatrix { samples }
    }

    pub fn width(&self) -> usize {
        self.samples.ncols()
    }

    pub fn height(&self) -> usize {
        self.samples.nrows()
    }

    pub fn view(&self) -> ArrayView2<'_, u16> {
        self.samples.view()
    }

    pub fn get(&self, x: usize, y: usize) -> Option<u16> {
        self.samples.get((y, x)).copied()
    }
}

/// Decodes `bytes` laid out as `layout` into an [`IntensityMatrix`].
pub fn decode(bytes: &[u8], layout: RawLayout) -> Result<IntensityMatrix> {
    if !matches!(layout.sample_bytes, 1 | 2) {
        return Err(Error::UnsupportedSampleWidth(layout.sample_bytes));
    }
    let shape_error = || Error::InvalidShape {
        width: layout.width,
        height: layout.height,
        samples: bytes.len() / layout.sample_bytes,
    };
    let expected = layout.expected_len().ok_or_else(shape_error)?;
    if bytes.len() != expected {
        return Err(Error::MalformedPayload {
            expected,
            actual: bytes.len(),
        });
    }

    let num_samples = expected / layout.sample_bytes;
    let mut rdr = ByteOrdered::runtime(bytes, layout.byte_order.into());
    let mut samples = Vec::with_capacity(num_samples);
    for _ in 0..num_samples {
        // Length was checked above; a short read cannot happen.
        let sample = match layout.sample_bytes {
            1 => rdr.read_u8().map(u16::from),
            _ => rdr.read_u16(),
        }
        .map_err(|_| Error::MalformedPayload {
            expected,
            actual: bytes.len(),
        })?;
        samples.push(sample);
    }

    IntensityMatrix::from_shape_vec(layout.width, layout.height, samples)
}

/// Inverse of [`decode`]. Samples wider than `sample_bytes` are
/// truncated to their low bits.
pub fn encode(matrix: &IntensityMatrix, sample_bytes: usize, order: ByteOrder) -> Result<Vec<u8>> {
    if !matches!(sample_bytes, 1 | 2) {
        return Err(Error::UnsupportedSampleWidth(sample_bytes));
    }
    let len = matrix.width() * matrix.height() * sample_bytes;
    let mut wtr = ByteOrdered::runtime(Cursor::new(Vec::with_capacity(len)), order.into());
    for &sample in matrix.view().iter() {
        let written = match sample_bytes {
            1 => wtr.write_u8(sample as u8),
            _ => wtr.write_u16(sample),
        };
        written.map_err(|e| Error::Capture(e.to_string()))?;
    }
    Ok(wtr.into_inner().into_inner())
}
