//! The persisted analysis state of one image.
//!
//! A session is stored as pretty-printed JSON next to its image
//! (`photo.jpg` -> `photo.json`). Loading is tolerant: every field
//! that is missing or has the wrong shape falls back to its default
//! on its own, malformed ROIs are dropped, and unknown keys are kept
//! so that newer files survive a round trip through older code.
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use serde_derive::*;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    roi::Roi,
    temperature::{validate_emissivity, CalibrationParameters},
};

pub const SESSION_FORMAT_VERSION: &str = "1.0";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeMode {
    Auto,
    Manual,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureRange {
    pub mode: RangeMode,
    pub manual_min: f64,
    pub manual_max: f64,
}

impl Default for TemperatureRange {
    fn default() -> Self {
        TemperatureRange {
            mode: RangeMode::Auto,
            manual_min: 0.0,
            manual_max: 100.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    /// Opacity of the IR layer over the visible image, in percent.
    pub opacity: u8,
    pub blend_mode: String,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        OverlaySettings {
            opacity: 50,
            blend_mode: "Normal".into(),
        }
    }
}

/// Which values are drawn next to each ROI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiLabelSettings {
    pub name: bool,
    pub emissivity: bool,
    pub min: bool,
    pub max: bool,
    pub mean: bool,
    pub median: bool,
}

impl Default for RoiLabelSettings {
    fn default() -> Self {
        RoiLabelSettings {
            name: true,
            emissivity: true,
            min: true,
            max: true,
            mean: true,
            median: false,
        }
    }
}

/// Display preferences. Not interpreted by the analysis core; kept
/// so that the presentation layer finds them again on reload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayPreferences {
    pub palette: String,
    pub palette_inverted: bool,
    pub temperature_range: TemperatureRange,
    pub overlay: OverlaySettings,
    pub roi_labels: RoiLabelSettings,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for DisplayPreferences {
    fn default() -> Self {
        DisplayPreferences {
            palette: "Iron".into(),
            palette_inverted: false,
            temperature_range: TemperatureRange::default(),
            overlay: OverlaySettings::default(),
            roi_labels: RoiLabelSettings::default(),
            extra: BTreeMap::new(),
        }
    }
}

/// Calibration, ROIs and preferences of one image.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Session {
    pub version: String,
    /// Path of the image this session belongs to.
    pub image: Option<String>,
    pub calibration: CalibrationParameters,
    /// In display and export order.
    pub rois: Vec<Roi>,
    pub preferences: DisplayPreferences,
    /// Top-level keys this version does not know about.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Session {
    pub fn new(image: Option<String>, calibration: CalibrationParameters) -> Self {
        Session {
            version: SESSION_FORMAT_VERSION.into(),
            image,
            calibration,
            rois: vec![],
            preferences: DisplayPreferences::default(),
            extra: BTreeMap::new(),
        }
    }

    pub fn roi(&self, id: Uuid) -> Option<&Roi> {
        self.rois.iter().find(|r| r.id == id)
    }

    pub fn roi_mut(&mut self, id: Uuid) -> Option<&mut Roi> {
        self.rois.iter_mut().find(|r| r.id == id)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parses a session file. Only syntactically invalid JSON, or a
    /// document that is not an object, is an error; everything else
    /// falls back to defaults, with `defaults` used for calibration
    /// fields the file lacks.
    pub fn from_json(
        text: &str,
        defaults: &CalibrationParameters,
    ) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Object(map) => Ok(Self::from_map(map, defaults)),
            other => Err(serde::de::Error::custom(format!(
                "expected a JSON object, found {}",
                json_kind(&other)
            ))),
        }
    }

    fn from_map(mut map: Map<String, Value>, defaults: &CalibrationParameters) -> Self {
        let version = match map.remove("version") {
            Some(Value::String(v)) => v,
            _ => SESSION_FORMAT_VERSION.into(),
        };
        let image = match map.remove("image") {
            Some(Value::String(path)) => Some(path),
            _ => None,
        };
        let calibration = match map.remove("calibration") {
            Some(value) => lenient_section("calibration", value, defaults.clone(), |c| {
                c.validate().is_ok()
            }),
            None => defaults.clone(),
        };
        let preferences = match map.remove("preferences") {
            Some(value) => {
                lenient_section("preferences", value, DisplayPreferences::default(), |_| true)
            }
            None => DisplayPreferences::default(),
        };
        let rois = match map.remove("rois") {
            Some(Value::Array(items)) => decode_rois(items),
            Some(other) => {
                warn!("ignoring `rois`: expected an array, found {}", json_kind(&other));
                vec![]
            }
            None => vec![],
        };

        Session {
            version,
            image,
            calibration,
            rois,
            preferences,
            extra: map.into_iter().collect(),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Decodes `value` over `base` one field at a time; a field that
/// does not decode, or makes `accept` fail, keeps its value from
/// `base`.
fn lenient_section<T, F>(section: &str, value: Value, base: T, accept: F) -> T
where
    T: Serialize + DeserializeOwned,
    F: Fn(&T) -> bool,
{
    let fields = match value {
        Value::Object(fields) => fields,
        other => {
            warn!("ignoring `{}`: expected an object, found {}", section, json_kind(&other));
            return base;
        }
    };
    let mut merged = match serde_json::to_value(&base) {
        Ok(Value::Object(map)) => map,
        _ => return base,
    };

    for (key, field) in fields {
        let previous = merged.insert(key.clone(), field);
        let ok = serde_json::from_value::<T>(Value::Object(merged.clone()))
            .map(|decoded| accept(&decoded))
            .unwrap_or(false);
        if !ok {
            warn!("ignoring invalid value for `{}.{}`", section, key);
            match previous {
                Some(previous) => merged.insert(key, previous),
                None => merged.remove(&key),
            };
        }
    }

    serde_json::from_value(Value::Object(merged)).unwrap_or(base)
}

fn decode_rois(items: Vec<Value>) -> Vec<Roi> {
    let mut seen = HashSet::new();
    let mut rois = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        let mut roi: Roi = match serde_json::from_value(item) {
            Ok(roi) => roi,
            Err(e) => {
                warn!("dropping ROI #{}: {}", idx, e);
                continue;
            }
        };
        if let Some(emissivity) = roi.emissivity {
            if validate_emissivity(emissivity).is_err() {
                warn!("ROI `{}`: dropping invalid emissivity {}", roi.name, emissivity);
                roi.emissivity = None;
            }
        }
        if !seen.insert(roi.id) {
            let id = Uuid::new_v4();
            warn!("ROI `{}`: duplicate id {}, reassigned {}", roi.name, roi.id, id);
            roi.id = id;
            seen.insert(id);
        }
        rois.push(roi);
    }
    rois
}

/// Location of a session file on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SessionStore { path: path.into() }
    }

    /// The session file belonging to `image`: same directory and
    /// stem, `.json` extension.
    pub fn sibling_of(image: &Path) -> Self {
        SessionStore {
            path: image.with_extension("json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Replaces the file with `session`. The new content is written
    /// to a temporary file in the same directory and renamed over
    /// the old one, so readers see either the old or the new file.
    pub fn save(&self, session: &Session) -> Result<()> {
        let err = |e: Box<dyn std::error::Error + Send + Sync>| Error::persistence(&self.path, e);
        let dir = self.directory();
        fs::create_dir_all(&dir).map_err(|e| err(e.into()))?;

        let tmp = NamedTempFile::new_in(&dir).map_err(|e| err(e.into()))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, session).map_err(|e| err(e.into()))?;
            writer.write_all(b"\n").map_err(|e| err(e.into()))?;
            writer.flush().map_err(|e| err(e.into()))?;
        }
        tmp.as_file().sync_all().map_err(|e| err(e.into()))?;
        tmp.persist(&self.path).map_err(|e| err(e.error.into()))?;

        debug!(path = %self.path.display(), rois = session.rois.len(), "session saved");
        Ok(())
    }

    /// Reads the session, `Ok(None)` if there is no file.
    pub fn load(&self, defaults: &CalibrationParameters) -> Result<Option<Session>> {
        if !self.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path).map_err(|e| Error::persistence(&self.path, e))?;
        let session =
            Session::from_json(&text, defaults).map_err(|e| Error::persistence(&self.path, e))?;
        info!(path = %self.path.display(), rois = session.rois.len(), "session loaded");
        Ok(Some(session))
    }

    /// Copies the file to `<stem><suffix>.json`. Returns the copy's
    /// path, or `None` if there is nothing to back up.
    pub fn backup(&self, suffix: &str) -> Result<Option<PathBuf>> {
        if !self.exists() {
            return Ok(None);
        }
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = self.path.with_file_name(format!("{}{}.json", stem, suffix));
        fs::copy(&self.path, &target).map_err(|e| Error::persistence(&target, e))?;
        info!(path = %target.display(), "session backup created");
        Ok(Some(target))
    }

    /// Removes the file. Returns whether there was one.
    pub fn delete(&self) -> Result<bool> {
        if !self.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path).map_err(|e| Error::persistence(&self.path, e))?;
        info!(path = %self.path.display(), "session file deleted");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roi::{Point, RoiGeometry};
    use crate::temperature::PlanckConstants;
    use anyhow::Result;
    use serde_json::json;

    fn sample_session() -> Session {
        let mut session = Session::new(
            Some("/data/flir/IR_0042.jpg".into()),
            CalibrationParameters {
                emissivity: 0.87,
                object_distance: 2.5,
                reflected_apparent_temperature: 21.3,
                relative_humidity: 0.1 + 0.2,
                atmospheric_transmission: Some(0.93),
                ..Default::default()
            },
        );
        let mut rect = Roi::new(
            "ROI_1",
            RoiGeometry::Rectangle {
                a: Point::new(10.25, 3.0),
                b: Point::new(40.0, 33.5),
            },
        );
        rect.style = json!({ "color": "#ffa500" });
        let mut spot = Roi::new(
            "Spot_2",
            RoiGeometry::Spot {
                center: Point::new(100.0, 80.0),
                radius: 4.75,
            },
        );
        spot.emissivity = Some(0.62);
        let polygon = Roi::new(
            "Polygon_3",
            RoiGeometry::Polygon {
                vertices: vec![
                    Point::new(1.0, 1.0),
                    Point::new(9.0, 1.5),
                    Point::new(5.0, 1.0 / 3.0),
                ],
            },
        );
        session.rois = vec![rect, spot, polygon];
        session.preferences.palette = "Rainbow".into();
        session
    }

    #[test]
    fn round_trips_exactly() -> Result<()> {
        let session = sample_session();
        let text = session.to_json()?;
        let loaded = Session::from_json(&text, &CalibrationParameters::default())?;
        assert_eq!(loaded, session);
        assert_eq!(loaded.to_json()?, text);
        Ok(())
    }

    #[test]
    fn store_round_trip_is_atomic() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SessionStore::sibling_of(&dir.path().join("IR_0042.jpg"));
        assert_eq!(store.path(), dir.path().join("IR_0042.json"));
        assert!(store.load(&CalibrationParameters::default())?.is_none());

        let session = sample_session();
        store.save(&session)?;
        store.save(&session)?;
        let loaded = store.load(&CalibrationParameters::default())?.unwrap();
        assert_eq!(loaded, session);

        // Only the session file remains, no temporaries.
        let entries: Vec<_> = fs::read_dir(dir.path())?.collect::<std::io::Result<_>>()?;
        assert_eq!(entries.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_fields_take_defaults() -> Result<()> {
        let camera = CalibrationParameters {
            planck: PlanckConstants {
                r1: 17000.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let text = r#"{ "version": "0.9", "calibration": { "emissivity": 0.8 } }"#;
        let session = Session::from_json(text, &camera)?;
        assert_eq!(session.version, "0.9");
        assert_eq!(session.calibration.emissivity, 0.8);
        assert_eq!(session.calibration.planck.r1, 17000.0);
        assert_eq!(session.calibration.object_distance, 1.0);
        assert!(session.rois.is_empty());
        assert_eq!(session.preferences, DisplayPreferences::default());
        Ok(())
    }

    #[test]
    fn invalid_values_fall_back_per_field() -> Result<()> {
        let text = r#"{
            "calibration": {
                "emissivity": 0.0,
                "object_distance": "far",
                "relative_humidity": 40.0
            },
            "preferences": { "palette_inverted": "yes", "palette": "Lava" }
        }"#;
        let session = Session::from_json(text, &CalibrationParameters::default())?;
        assert_eq!(session.calibration.emissivity, 0.95);
        assert_eq!(session.calibration.object_distance, 1.0);
        assert_eq!(session.calibration.relative_humidity, 40.0);
        assert_eq!(session.preferences.palette, "Lava");
        assert!(!session.preferences.palette_inverted);
        Ok(())
    }

    #[test]
    fn unknown_fields_are_preserved() -> Result<()> {
        let text = r#"{
            "export": { "csv_separator": ";" },
            "preferences": { "legend_position": "left" },
            "calibration": { "future_knob": 3 }
        }"#;
        let session = Session::from_json(text, &CalibrationParameters::default())?;
        assert_eq!(session.extra["export"], json!({ "csv_separator": ";" }));
        assert_eq!(session.preferences.extra["legend_position"], json!("left"));

        let reparsed: Value = serde_json::from_str(&session.to_json()?)?;
        assert_eq!(reparsed["export"]["csv_separator"], json!(";"));
        assert_eq!(reparsed["preferences"]["legend_position"], json!("left"));
        Ok(())
    }

    #[test]
    fn malformed_rois_are_dropped() -> Result<()> {
        let good = Roi::new(
            "ok",
            RoiGeometry::Spot {
                center: Point::new(1.0, 1.0),
                radius: 1.0,
            },
        );
        let text = json!({
            "rois": [
                { "name": "no geometry", "id": Uuid::new_v4() },
                good,
                {
                    "id": good.id,
                    "name": "dup",
                    "geometry": { "type": "spot", "center": { "x": 0.0, "y": 0.0 }, "radius": 2.0 },
                    "emissivity": 4.0
                },
                { "id": Uuid::new_v4(), "name": "hexagon", "geometry": { "type": "hexagon" } }
            ]
        })
        .to_string();
        let session = Session::from_json(&text, &CalibrationParameters::default())?;
        assert_eq!(session.rois.len(), 2);
        assert_eq!(session.rois[0], good);
        assert_eq!(session.rois[1].name, "dup");
        assert_ne!(session.rois[1].id, good.id);
        assert_eq!(session.rois[1].emissivity, None);
        Ok(())
    }

    #[test]
    fn rejects_non_object_documents() {
        assert!(Session::from_json("[1, 2]", &CalibrationParameters::default()).is_err());
        assert!(Session::from_json("{ not json", &CalibrationParameters::default()).is_err());
    }

    #[test]
    fn backup_and_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SessionStore::new(dir.path().join("scan.json"));
        assert_eq!(store.backup("_backup")?, None);
        assert!(!store.delete()?);

        store.save(&sample_session())?;
        let backup = store.backup("_backup")?.unwrap();
        assert_eq!(backup, dir.path().join("scan_backup.json"));
        assert_eq!(fs::read_to_string(&backup)?, fs::read_to_string(store.path())?);

        assert!(store.delete()?);
        assert!(!store.exists());
        assert!(backup.exists());
        Ok(())
    }

    #[test]
    fn unwritable_location_is_a_persistence_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"")?;
        let store = SessionStore::new(blocker.join("scan.json"));
        let err = store.save(&sample_session()).unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
        Ok(())
    }
}
