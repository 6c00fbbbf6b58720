//! Captures described by ExifTool JSON.
//!
//! The expected input is the output of `exiftool -j -b` on a
//! radiometric image: the calibration tags plus the embedded
//! `RawThermalImage` as a `base64:` string. Tags may carry their
//! group prefix (`APP1:PlanckR1`, from `exiftool -G`) or not, and
//! numeric tags may be numbers or strings with a unit suffix
//! (`"22.0 C"`, `"1.00 m"`, `"50.0 %"`).
//!
//! The raw payload is decoded according to `RawThermalImageType`:
//!
//! - `TIFF`: decoded with the `image` crate;
//! - `PNG`: a 16-bit grayscale frame whose samples are stored
//!   little-endian, unlike the PNG convention;
//! - anything else: bare little-endian 16-bit samples, with the
//!   dimensions taken from `RawThermalImageWidth` / `Height`.
use std::{collections::BTreeMap, io::Cursor, io::Read};

use anyhow::{anyhow, bail, Context};
use image::{tiff::TiffDecoder, ColorType, ImageDecoder};
use serde_derive::*;
use serde_json::{Deserializer, Value};
use tracing::debug;

use crate::{
    error::{Error, Result},
    raw::{decode, ByteOrder, IntensityMatrix, RawLayout},
    temperature::{Alignment, AtmosphereModel, CalibrationParameters, PlanckConstants},
};

/// Metadata of one image as produced by ExifTool, keyed by tag name
/// with any group prefix removed.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(from = "BTreeMap<String, Value>")]
pub struct ExiftoolCapture {
    tags: BTreeMap<String, Value>,
}

impl From<BTreeMap<String, Value>> for ExiftoolCapture {
    fn from(raw: BTreeMap<String, Value>) -> Self {
        let tags = raw
            .into_iter()
            .map(|(key, value)| {
                let name = key.rsplit(':').next().unwrap_or(&key).to_string();
                (name, value)
            })
            .collect();
        ExiftoolCapture { tags }
    }
}

/// A decoded capture: sensor counts and the calibration found in
/// its metadata.
#[derive(Clone, Debug)]
pub struct Capture {
    pub source: Option<String>,
    pub intensity: IntensityMatrix,
    pub calibration: CalibrationParameters,
}

impl ExiftoolCapture {
    pub fn source(&self) -> Option<&str> {
        self.tags.get("SourceFile").and_then(Value::as_str)
    }

    pub fn tag(&self, name: &str) -> Option<&Value> {
        self.tags.get(name)
    }

    /// Numeric value of tag `name`; `None` if absent or not a number.
    pub fn number(&self, name: &str) -> Option<f64> {
        self.tags.get(name).and_then(serde_helpers::float_with_suffix)
    }

    fn number_or(&self, name: &str, default: f64) -> f64 {
        self.number(name).unwrap_or(default)
    }

    /// Calibration from the metadata, with the documented default
    /// for every tag that is missing. The atmosphere is corrected with
    /// the default additive model; see
    /// [`thermimage_atmosphere`](Self::thermimage_atmosphere) for the
    /// camera's own model.
    pub fn calibration(&self) -> CalibrationParameters {
        let defaults = CalibrationParameters::default();
        let planck = PlanckConstants::default();

        // Real2IR is the visible-to-IR ratio; the overlay scale is its inverse.
        let scale = match self.number("Real2IR") {
            Some(ratio) if ratio.is_finite() && ratio > 0. => 1. / ratio,
            _ => defaults.alignment.scale,
        };

        CalibrationParameters {
            emissivity: self.number_or("Emissivity", defaults.emissivity),
            object_distance: self.number_or("ObjectDistance", defaults.object_distance),
            reflected_apparent_temperature: self.number_or(
                "ReflectedApparentTemperature",
                defaults.reflected_apparent_temperature,
            ),
            atmospheric_temperature: self
                .number_or("AtmosphericTemperature", defaults.atmospheric_temperature),
            relative_humidity: self.number_or("RelativeHumidity", defaults.relative_humidity),
            ir_window_temperature: self
                .number_or("IRWindowTemperature", defaults.ir_window_temperature),
            ir_window_transmission: self
                .number_or("IRWindowTransmission", defaults.ir_window_transmission),
            atmospheric_transmission: self
                .number("AtmosphericTransmission")
                .or(defaults.atmospheric_transmission),
            atmosphere: defaults.atmosphere,
            planck: PlanckConstants {
                r1: self.number_or("PlanckR1", planck.r1),
                r2: self.number_or("PlanckR2", planck.r2),
                b: self.number_or("PlanckB", planck.b),
                f: self.number_or("PlanckF", planck.f),
                o: self.number_or("PlanckO", planck.o),
            },
            alignment: Alignment {
                scale,
                offset_x: self.number_or("OffsetX", defaults.alignment.offset_x),
                offset_y: self.number_or("OffsetY", defaults.alignment.offset_y),
            },
        }
    }

    /// Thermimage atmosphere model with the camera's `AtmosphericTrans*`
    /// constants, falling back to the common FLIR values.
    pub fn thermimage_atmosphere(&self) -> AtmosphereModel {
        match AtmosphereModel::thermimage() {
            AtmosphereModel::Thermimage {
                alpha_1,
                alpha_2,
                beta_1,
                beta_2,
                x,
            } => AtmosphereModel::Thermimage {
                alpha_1: self.number_or("AtmosphericTransAlpha1", alpha_1),
                alpha_2: self.number_or("AtmosphericTransAlpha2", alpha_2),
                beta_1: self.number_or("AtmosphericTransBeta1", beta_1),
                beta_2: self.number_or("AtmosphericTransBeta2", beta_2),
                x: self.number_or("AtmosphericTransX", x),
            },
            other => other,
        }
    }

    /// Decodes the embedded raw thermal image.
    pub fn intensity(&self) -> Result<IntensityMatrix> {
        self.try_intensity().map_err(|e| match e.downcast::<Error>() {
            Ok(e) => e,
            Err(e) => Error::Capture(format!("{:#}", e)),
        })
    }

    fn try_intensity(&self) -> anyhow::Result<IntensityMatrix> {
        let encoded = self
            .tags
            .get("RawThermalImage")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("no RawThermalImage tag (was exiftool run with -b?)"))?;
        let bytes = serde_helpers::base64_bytes(encoded)?;
        if bytes.is_empty() {
            bail!("RawThermalImage is empty");
        }

        let ty = self
            .tags
            .get("RawThermalImageType")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        debug!(ty, len = bytes.len(), "decoding raw thermal image");
        match ty {
            "TIFF" => decode_tiff(&bytes),
            "PNG" => decode_png(&bytes),
            _ => {
                let dimension = |tag: &str| -> anyhow::Result<usize> {
                    match self.number(tag) {
                        Some(v) if v >= 1. && v <= u32::MAX as f64 && v.fract() == 0. => {
                            Ok(v as usize)
                        }
                        _ => bail!("{} missing or invalid", tag),
                    }
                };
                let layout = RawLayout::u16(
                    dimension("RawThermalImageWidth")?,
                    dimension("RawThermalImageHeight")?,
                    ByteOrder::Little,
                );
                Ok(decode(&bytes, layout)?)
            }
        }
    }

    pub fn into_capture(self) -> Result<Capture> {
        let calibration = self.calibration();
        calibration.validate()?;
        Ok(Capture {
            intensity: self.intensity()?,
            source: self.source().map(str::to_string),
            calibration,
        })
    }
}

fn decode_tiff(bytes: &[u8]) -> anyhow::Result<IntensityMatrix> {
    let decoder = TiffDecoder::new(Cursor::new(bytes)).context("invalid TIFF payload")?;
    let (width, height) = decoder.dimensions();
    let (width, height) = (width as usize, height as usize);

    use zerocopy::{AsBytes, FromBytes};
    fn read_samples<'a, T, D>(decoder: D, num_pixels: usize) -> anyhow::Result<Vec<u16>>
    where
        u16: From<T>,
        T: AsBytes + FromBytes + Copy + Default,
        D: ImageDecoder<'a>,
    {
        let mut image = vec![T::default(); num_pixels];
        decoder.read_image(image.as_bytes_mut())?;
        Ok(image.into_iter().map(u16::from).collect())
    }

    let num_pixels = width
        .checked_mul(height)
        .ok_or_else(|| anyhow!("TIFF dimensions {}x{} overflow", width, height))?;
    let samples = match decoder.color_type() {
        ColorType::L8 => read_samples::<u8, _>(decoder, num_pixels)?,
        ColorType::L16 => read_samples::<u16, _>(decoder, num_pixels)?,
        other => bail!("unsupported TIFF color type: {:?}", other),
    };
    Ok(IntensityMatrix::from_shape_vec(width, height, samples)?)
}

fn decode_png(bytes: &[u8]) -> anyhow::Result<IntensityMatrix> {
    let mut decoder = png::Decoder::new(Cursor::new(bytes));
    decoder.set_transformations(png::Transformations::IDENTITY);
    let (info, mut reader) = decoder.read_info().context("invalid PNG payload")?;
    if info.color_type != png::ColorType::Grayscale || info.bit_depth != png::BitDepth::Sixteen {
        bail!(
            "unsupported PNG format: {:?} at {:?} bits",
            info.color_type,
            info.bit_depth
        );
    }
    let mut frame = vec![0; info.buffer_size()];
    reader.next_frame(&mut frame)?;

    let (width, height) = (info.width as usize, info.height as usize);
    let row = width * 2;
    if info.line_size != row {
        bail!("unexpected PNG row size {} for width {}", info.line_size, width);
    }
    Ok(decode(
        &frame[..row * height],
        RawLayout::u16(width, height, ByteOrder::Little),
    )?)
}

/// Reads ExifTool JSON: either one array of objects (`exiftool -j`)
/// or a stream of objects.
pub fn read_exiftool_json<R: Read>(rdr: R) -> Result<Vec<ExiftoolCapture>> {
    let mut captures = vec![];
    for value in Deserializer::from_reader(rdr).into_iter::<Value>() {
        let value = value.map_err(|e| Error::Capture(e.to_string()))?;
        let items = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        for item in items {
            let capture = serde_json::from_value(item).map_err(|e| Error::Capture(e.to_string()))?;
            captures.push(capture);
        }
    }
    Ok(captures)
}

mod serde_helpers {
    use lazy_static::lazy_static;
    use regex::Regex;
    use serde_json::Value;

    /// A number, or a string starting with one (`"-3.5 C"`).
    pub fn float_with_suffix(value: &Value) -> Option<f64> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(r"^\s*[-+]?(\d+\.?\d*|\.\d+)([eE][-+]?\d+)?").unwrap();
        }
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => RE.find(s)?.as_str().trim().parse().ok(),
            _ => None,
        }
    }

    pub fn base64_bytes(str_rep: &str) -> anyhow::Result<Vec<u8>> {
        lazy_static! {
            static ref RE: Regex = Regex::new(r"^base64:").unwrap();
        }
        let prefix = RE
            .find(str_rep)
            .ok_or_else(|| anyhow::anyhow!("unexpected format: must begin with `base64:`"))?;
        Ok(base64::decode(&str_rep[prefix.end()..])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;

    fn with_payload(ty: &str, bytes: &[u8]) -> Value {
        json!({
            "SourceFile": "IR_0001.jpg",
            "APP1:RawThermalImageType": ty,
            "APP1:RawThermalImage": format!("base64:{}", base64::encode(bytes)),
        })
    }

    #[test]
    fn parses_unit_suffixed_values() {
        let f = |v: Value| serde_helpers::float_with_suffix(&v);
        assert_eq!(f(json!("22.0 C")), Some(22.0));
        assert_eq!(f(json!("-12.5 C")), Some(-12.5));
        assert_eq!(f(json!("1.00 m")), Some(1.0));
        assert_eq!(f(json!("50.0 %")), Some(50.0));
        assert_eq!(f(json!("1.5e-2")), Some(0.015));
        assert_eq!(f(json!(0.95)), Some(0.95));
        assert_eq!(f(json!(-7340)), Some(-7340.0));
        assert_eq!(f(json!("n/a")), None);
        assert_eq!(f(json!(true)), None);
    }

    #[test]
    fn calibration_from_tags() -> Result<()> {
        let capture: ExiftoolCapture = serde_json::from_value(json!({
            "APP1:Emissivity": 0.98,
            "ObjectDistance": "2.50 m",
            "APP1:ReflectedApparentTemperature": "-5.0 C",
            "APP1:RelativeHumidity": "35.0 %",
            "APP1:PlanckR1": 17096.453,
            "APP1:PlanckO": -6642,
            "APP1:AtmosphericTransX": 1.7,
            "APP1:Real2IR": 1.25,
            "APP1:OffsetX": -4,
        }))?;
        let c = capture.calibration();
        assert_eq!(c.emissivity, 0.98);
        assert_eq!(c.object_distance, 2.5);
        assert_eq!(c.reflected_apparent_temperature, -5.0);
        assert_eq!(c.relative_humidity, 35.0);
        assert_eq!(c.planck.r1, 17096.453);
        assert_eq!(c.planck.o, -6642.0);
        assert_eq!(c.planck.b, PlanckConstants::default().b);
        assert_eq!(c.atmosphere, AtmosphereModel::default());
        assert!(matches!(
            capture.thermimage_atmosphere(),
            AtmosphereModel::Thermimage { x, .. } if x == 1.7
        ));
        assert_eq!(c.alignment.scale, 0.8);
        assert_eq!(c.alignment.offset_x, -4.0);
        assert_eq!(c.alignment.offset_y, 0.0);
        assert_eq!(c.atmospheric_transmission, Some(0.95));

        let hazy: ExiftoolCapture =
            serde_json::from_value(json!({ "AtmosphericTransmission": "0.80" }))?;
        assert_eq!(hazy.calibration().atmospheric_transmission, Some(0.8));
        Ok(())
    }

    #[test]
    fn missing_tags_take_defaults() -> Result<()> {
        let capture: ExiftoolCapture = serde_json::from_value(json!({}))?;
        assert_eq!(capture.calibration(), CalibrationParameters::default());
        assert!(matches!(capture.intensity(), Err(Error::Capture(_))));
        Ok(())
    }

    #[test]
    fn bare_samples_are_little_endian() -> Result<()> {
        let mut value = with_payload("Unknown", &[0x34, 0x12, 0xcd, 0xab, 0x01, 0x00]);
        value["APP1:RawThermalImageWidth"] = json!(3);
        value["APP1:RawThermalImageHeight"] = json!(1);
        let exif: ExiftoolCapture = serde_json::from_value(value)?;
        let capture = exif.into_capture()?;
        assert_eq!(capture.source.as_deref(), Some("IR_0001.jpg"));
        assert_eq!(capture.intensity.get(0, 0), Some(0x1234));
        assert_eq!(capture.intensity.get(1, 0), Some(0xabcd));
        assert_eq!(capture.intensity.get(2, 0), Some(1));
        Ok(())
    }

    #[test]
    fn bare_samples_need_matching_dimensions() -> Result<()> {
        let mut value = with_payload("Unknown", &[0; 6]);
        value["RawThermalImageWidth"] = json!(2);
        value["RawThermalImageHeight"] = json!(2);
        let capture: ExiftoolCapture = serde_json::from_value(value)?;
        assert!(matches!(
            capture.intensity(),
            Err(Error::MalformedPayload { expected: 8, actual: 6 })
        ));
        Ok(())
    }

    #[test]
    fn oversized_dimensions_are_rejected() -> Result<()> {
        for (width, height) in [(json!(1e20), json!(2)), (json!(4294967296u64), json!(1))] {
            let mut value = with_payload("Unknown", &[0; 4]);
            value["RawThermalImageWidth"] = width;
            value["RawThermalImageHeight"] = height;
            let capture: ExiftoolCapture = serde_json::from_value(value)?;
            assert!(matches!(capture.intensity(), Err(Error::Capture(_))));
        }
        // Both within range, but the payload length overflows.
        let mut value = with_payload("Unknown", &[0; 4]);
        value["RawThermalImageWidth"] = json!(u32::MAX);
        value["RawThermalImageHeight"] = json!(u32::MAX);
        let capture: ExiftoolCapture = serde_json::from_value(value)?;
        assert!(matches!(capture.intensity(), Err(Error::InvalidShape { .. })));
        Ok(())
    }

    #[test]
    fn png_samples_are_byte_swapped() -> Result<()> {
        // The frame holds 0x1234 and 0xabcd stored little-endian.
        let frame = [0x34, 0x12, 0xcd, 0xab];
        let mut encoded = vec![];
        {
            let mut encoder = png::Encoder::new(&mut encoded, 2, 1);
            encoder.set_color(png::ColorType::Grayscale);
            encoder.set_depth(png::BitDepth::Sixteen);
            let mut writer = encoder.write_header()?;
            writer.write_image_data(&frame)?;
        }
        let capture: ExiftoolCapture = serde_json::from_value(with_payload("PNG", &encoded))?;
        let intensity = capture.intensity()?;
        assert_eq!((intensity.width(), intensity.height()), (2, 1));
        assert_eq!(intensity.get(0, 0), Some(0x1234));
        assert_eq!(intensity.get(1, 0), Some(0xabcd));
        Ok(())
    }

    #[test]
    fn tiff_payload() -> Result<()> {
        use image::tiff::TiffEncoder;
        let pixels = [10u8, 20, 30, 40, 50, 60];
        let mut encoded = Cursor::new(vec![]);
        TiffEncoder::new(&mut encoded).encode(&pixels, 3, 2, ColorType::L8)?;

        let capture: ExiftoolCapture =
            serde_json::from_value(with_payload("TIFF", encoded.get_ref()))?;
        let intensity = capture.intensity()?;
        assert_eq!((intensity.width(), intensity.height()), (3, 2));
        assert_eq!(intensity.get(2, 0), Some(30));
        assert_eq!(intensity.get(0, 1), Some(40));
        Ok(())
    }

    #[test]
    fn payload_needs_base64_prefix() -> Result<()> {
        let capture: ExiftoolCapture = serde_json::from_value(json!({
            "RawThermalImageType": "PNG",
            "RawThermalImage": "(Binary data 1234 bytes, use -b option to extract)",
        }))?;
        assert!(matches!(capture.intensity(), Err(Error::Capture(_))));
        Ok(())
    }

    #[test]
    fn reads_arrays_and_streams() -> Result<()> {
        let array = r#"[{"SourceFile": "a.jpg"}, {"SourceFile": "b.jpg"}]"#;
        let stream = r#"{"SourceFile": "a.jpg"} {"SourceFile": "b.jpg"}"#;
        for input in [array, stream] {
            let captures = read_exiftool_json(input.as_bytes())?;
            let sources: Vec<_> = captures.iter().map(|c| c.source()).collect();
            assert_eq!(sources, [Some("a.jpg"), Some("b.jpg")]);
        }
        Ok(())
    }
}
