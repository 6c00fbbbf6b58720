//! Calibrated temperatures and region statistics from
//! radiometric thermal captures.
//!
//! The crate is the numeric core of a thermal analysis
//! tool. It covers:
//!
//! 1. Decoding raw sensor payloads into an
//! [`IntensityMatrix`] ([`raw`]), directly or from
//! ExifTool generated JSON ([`exif`]).
//!
//! 2. Converting sensor counts to °C with the Planck
//! calibration of the camera and the measurement
//! environment ([`temperature`]). The model is a port of
//! the [Thermimage R library].
//!
//! 3. Regions of interest: rectangles, spots and polygons,
//! rasterized to pixel masks and reduced to min, max, mean,
//! median and standard deviation ([`roi`]).
//!
//! 4. A persisted [`Session`] per image and a
//! [`Workspace`] keeping derived results consistent with
//! the latest edits ([`session`], [`workspace`]).
//!
//! # Usage
//!
//! ```rust
//! # fn test_compile() -> anyhow::Result<()> {
//! use std::{fs::File, io::BufReader, path::Path};
//! use thermal_roi::{exif::read_exiftool_json, roi::{Point, RoiGeometry}, Workspace};
//!
//! let exif = read_exiftool_json(BufReader::new(File::open("IR_0042.json")?))?;
//! for capture in exif {
//!     let capture = capture.into_capture()?;
//!     let mut ws = Workspace::open(
//!         Path::new("IR_0042.jpg"),
//!         capture.intensity,
//!         capture.calibration,
//!     )?;
//!     let id = ws.add_roi(
//!         RoiGeometry::Spot { center: Point::new(80., 60.), radius: 5. },
//!         None,
//!     )?;
//!     println!("{:?}", ws.roi_statistics(id)?.mean());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [Thermimage R library]: //github.com/gtatters/Thermimage/blob/master/R/raw2temp.R

pub mod error;
pub mod raw;
pub mod roi;
pub mod temperature;

pub mod session;
pub mod workspace;

pub mod batch;
pub mod exif;

pub mod cli;

pub use crate::error::{Error, Result};
pub use crate::raw::IntensityMatrix;
pub use crate::session::{Session, SessionStore};
pub use crate::temperature::{CalibrationParameters, TemperatureMatrix};
pub use crate::workspace::Workspace;
