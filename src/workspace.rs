//! The editable analysis document of one image.
//!
//! A [`Workspace`] owns the intensity matrix and the [`Session`] of
//! one capture. Derived data (the temperature matrix, ROI masks and
//! statistics) is computed on demand and cached together with the
//! revisions it was computed from: a calibration revision shared by
//! all ROIs and one revision per ROI. A cached value is only handed
//! out while its revisions are current, so a reader never observes a
//! result computed from superseded parameters.
//!
//! Every mutation is validated first, then applied, then written
//! through to the session file when the workspace has a store.
use std::{collections::HashMap, path::Path, sync::Arc};

use serde_derive::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    raw::IntensityMatrix,
    roi::{rasterize, roi_statistics, Mask, Roi, RoiGeometry, RoiKind, RoiStatistics},
    session::{DisplayPreferences, Session, SessionStore},
    temperature::{
        masked_temperatures, temperature_matrix, validate_emissivity, CalibrationParameters,
        CalibrationScope, TemperatureMatrix,
    },
};

struct CachedStatistics {
    calibration_rev: u64,
    roi_rev: u64,
    statistics: RoiStatistics,
}

/// One line of a per-ROI report.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExportRow {
    pub id: Uuid,
    pub name: String,
    pub kind: RoiKind,
    /// Emissivity the statistics were computed with.
    pub emissivity: f64,
    pub emissivity_overridden: bool,
    #[serde(flatten)]
    pub statistics: RoiStatistics,
}

pub struct Workspace {
    intensity: IntensityMatrix,
    session: Session,
    store: Option<SessionStore>,

    calibration_rev: u64,
    roi_revs: HashMap<Uuid, u64>,
    next_roi_rev: u64,
    name_counter: usize,

    temperatures: Option<(u64, Arc<TemperatureMatrix>)>,
    masks: HashMap<Uuid, (u64, Arc<Mask>)>,
    statistics: HashMap<Uuid, CachedStatistics>,
}

impl Workspace {
    /// Wraps an existing session. Nothing is written until the
    /// first mutation or an explicit [`save`](Self::save).
    pub fn new(
        intensity: IntensityMatrix,
        session: Session,
        store: Option<SessionStore>,
    ) -> Result<Self> {
        session.calibration.validate()?;
        let mut ws = Workspace {
            intensity,
            name_counter: session.rois.len(),
            session,
            store,
            calibration_rev: 0,
            roi_revs: HashMap::new(),
            next_roi_rev: 0,
            temperatures: None,
            masks: HashMap::new(),
            statistics: HashMap::new(),
        };
        let ids: Vec<_> = ws.session.rois.iter().map(|r| r.id).collect();
        for id in ids {
            ws.touch_roi(id);
        }
        Ok(ws)
    }

    /// Opens the workspace of the image at `image`, restoring its
    /// sibling session file when there is one. `calibration` comes
    /// from the capture metadata and is used for a new session, and
    /// for any calibration field the session file lacks. Everything
    /// the file does hold, alignment and Planck constants included,
    /// is restored as saved.
    ///
    /// An unreadable session file is kept as a `_corrupt` backup and
    /// replaced by a fresh session.
    pub fn open(
        image: &Path,
        intensity: IntensityMatrix,
        calibration: CalibrationParameters,
    ) -> Result<Self> {
        calibration.validate()?;
        let store = SessionStore::sibling_of(image);
        let image_ref = Some(image.to_string_lossy().into_owned());

        let (session, fresh) = match store.load(&calibration) {
            Ok(Some(mut session)) => {
                session.image = image_ref;
                (session, false)
            }
            Ok(None) => (Session::new(image_ref, calibration), true),
            Err(e) => {
                warn!("{}; starting a new session", e);
                if let Err(e) = store.backup("_corrupt") {
                    warn!("could not back up unreadable session: {}", e);
                }
                (Session::new(image_ref, calibration), true)
            }
        };

        let ws = Workspace::new(intensity, session, Some(store))?;
        info!(
            image = %image.display(),
            rois = ws.session.rois.len(),
            restored = !fresh,
            "workspace opened"
        );
        if fresh {
            if let Err(e) = ws.save() {
                warn!("{}", e);
            }
        }
        Ok(ws)
    }

    pub fn intensity(&self) -> &IntensityMatrix {
        &self.intensity
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn store(&self) -> Option<&SessionStore> {
        self.store.as_ref()
    }

    pub fn calibration(&self) -> &CalibrationParameters {
        &self.session.calibration
    }

    pub fn rois(&self) -> &[Roi] {
        &self.session.rois
    }

    pub fn roi(&self, id: Uuid) -> Result<&Roi> {
        self.session.roi(id).ok_or(Error::UnknownRoi(id))
    }

    /// Writes the session to its store, if any.
    pub fn save(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.save(&self.session),
            None => Ok(()),
        }
    }

    fn touch_roi(&mut self, id: Uuid) {
        self.next_roi_rev += 1;
        self.roi_revs.insert(id, self.next_roi_rev);
        self.masks.remove(&id);
        self.statistics.remove(&id);
    }

    fn roi_mut(&mut self, id: Uuid) -> Result<&mut Roi> {
        self.session.roi_mut(id).ok_or(Error::UnknownRoi(id))
    }

    // Mutations

    /// Replaces the calibration. Invalid parameters are rejected
    /// and leave the workspace unchanged.
    pub fn set_calibration(&mut self, calibration: CalibrationParameters) -> Result<()> {
        calibration.validate()?;
        if calibration == self.session.calibration {
            return Ok(());
        }
        self.session.calibration = calibration;
        self.calibration_rev += 1;
        self.temperatures = None;
        self.statistics.clear();
        debug!(revision = self.calibration_rev, "calibration changed");
        self.save()
    }

    /// Edits a copy of the calibration with `f` and applies it.
    pub fn update_calibration<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CalibrationParameters),
    {
        let mut calibration = self.session.calibration.clone();
        f(&mut calibration);
        self.set_calibration(calibration)
    }

    /// A new ROI named after its kind (`ROI_1`, `Spot_2`, ...) unless
    /// `name` is given. It is not part of the session until passed
    /// to [`insert_roi`](Self::insert_roi).
    pub fn new_roi(&mut self, geometry: RoiGeometry, name: Option<String>) -> Roi {
        self.name_counter += 1;
        let name = name.unwrap_or_else(|| {
            format!("{}_{}", geometry.kind().name_prefix(), self.name_counter)
        });
        Roi::new(name, geometry)
    }

    /// Appends `roi` to the session. An invalid emissivity override
    /// or an id already in use is rejected without changing anything;
    /// otherwise the ROI stays in the session even if writing the
    /// session fails.
    pub fn insert_roi(&mut self, roi: Roi) -> Result<()> {
        if let Some(e) = roi.emissivity {
            validate_emissivity(e)?;
        }
        if self.session.roi(roi.id).is_some() {
            return Err(Error::DuplicateRoi(roi.id));
        }
        let id = roi.id;
        debug!(%id, name = %roi.name, "ROI added");
        self.session.rois.push(roi);
        self.touch_roi(id);
        self.save()
    }

    /// [`new_roi`](Self::new_roi) followed by
    /// [`insert_roi`](Self::insert_roi). On a failed save the ROI is
    /// still added; use the two steps to keep hold of its id.
    pub fn add_roi(&mut self, geometry: RoiGeometry, name: Option<String>) -> Result<Uuid> {
        let roi = self.new_roi(geometry, name);
        let id = roi.id;
        self.insert_roi(roi)?;
        Ok(id)
    }

    pub fn set_roi_geometry(&mut self, id: Uuid, geometry: RoiGeometry) -> Result<()> {
        self.roi_mut(id)?.geometry = geometry;
        self.touch_roi(id);
        self.save()
    }

    /// Sets or clears the emissivity used for one ROI only.
    pub fn set_roi_emissivity(&mut self, id: Uuid, emissivity: Option<f64>) -> Result<()> {
        if let Some(e) = emissivity {
            validate_emissivity(e)?;
        }
        let roi = self.roi_mut(id)?;
        if roi.emissivity == emissivity {
            return Ok(());
        }
        roi.emissivity = emissivity;
        self.touch_roi(id);
        self.save()
    }

    pub fn rename_roi(&mut self, id: Uuid, name: impl Into<String>) -> Result<()> {
        self.roi_mut(id)?.name = name.into();
        self.save()
    }

    pub fn set_roi_style(&mut self, id: Uuid, style: serde_json::Value) -> Result<()> {
        self.roi_mut(id)?.style = style;
        self.save()
    }

    pub fn remove_roi(&mut self, id: Uuid) -> Result<()> {
        let idx = self
            .session
            .rois
            .iter()
            .position(|r| r.id == id)
            .ok_or(Error::UnknownRoi(id))?;
        self.session.rois.remove(idx);
        self.roi_revs.remove(&id);
        self.masks.remove(&id);
        self.statistics.remove(&id);
        self.save()
    }

    /// Removes every ROI and restarts default naming at 1.
    pub fn clear_rois(&mut self) -> Result<()> {
        self.session.rois.clear();
        self.roi_revs.clear();
        self.masks.clear();
        self.statistics.clear();
        self.name_counter = 0;
        self.save()
    }

    pub fn set_preferences(&mut self, preferences: DisplayPreferences) -> Result<()> {
        self.session.preferences = preferences;
        self.save()
    }

    // Readers

    /// Temperature matrix for the current calibration.
    pub fn temperatures(&mut self) -> Result<Arc<TemperatureMatrix>> {
        if let Some((rev, temps)) = &self.temperatures {
            if *rev == self.calibration_rev {
                return Ok(temps.clone());
            }
        }
        let temps = Arc::new(temperature_matrix(&self.intensity, &self.session.calibration)?);
        self.temperatures = Some((self.calibration_rev, temps.clone()));
        Ok(temps)
    }

    pub fn roi_mask(&mut self, id: Uuid) -> Result<Arc<Mask>> {
        let rev = self.roi_revs.get(&id).copied().ok_or(Error::UnknownRoi(id))?;
        if let Some((cached_rev, mask)) = self.masks.get(&id) {
            if *cached_rev == rev {
                return Ok(mask.clone());
            }
        }
        let geometry = &self.roi(id)?.geometry;
        let (width, height) = (self.intensity.width(), self.intensity.height());
        let mask = Arc::new(rasterize(geometry, width, height));
        self.masks.insert(id, (rev, mask.clone()));
        Ok(mask)
    }

    /// Statistics of one ROI, computed with its own emissivity when
    /// it overrides the global one.
    pub fn roi_statistics(&mut self, id: Uuid) -> Result<RoiStatistics> {
        if let Some(statistics) = self.cached_statistics(id) {
            return Ok(statistics.clone());
        }
        let roi_rev = self.roi_revs.get(&id).copied().ok_or(Error::UnknownRoi(id))?;
        let mask = self.roi_mask(id)?;
        let emissivity = self.roi(id)?.emissivity;

        let statistics = match emissivity {
            Some(emissivity) => {
                let values = masked_temperatures(
                    &self.intensity,
                    &self.session.calibration,
                    CalibrationScope::RoiLocal { emissivity },
                    &mask,
                )?;
                RoiStatistics::from_values(mask.pixel_count(), values)
            }
            None => roi_statistics(&*self.temperatures()?, &mask),
        };
        debug!(%id, pixels = statistics.pixel_count, "ROI statistics computed");

        self.statistics.insert(
            id,
            CachedStatistics {
                calibration_rev: self.calibration_rev,
                roi_rev,
                statistics: statistics.clone(),
            },
        );
        Ok(statistics)
    }

    /// Statistics of every ROI, in session order.
    pub fn all_statistics(&mut self) -> Result<Vec<(Uuid, RoiStatistics)>> {
        let ids: Vec<_> = self.session.rois.iter().map(|r| r.id).collect();
        ids.into_iter()
            .map(|id| Ok((id, self.roi_statistics(id)?)))
            .collect()
    }

    /// Statistics computed earlier for the current parameters, if any.
    pub fn cached_statistics(&self, id: Uuid) -> Option<&RoiStatistics> {
        let roi_rev = *self.roi_revs.get(&id)?;
        self.statistics
            .get(&id)
            .filter(|c| c.calibration_rev == self.calibration_rev && c.roi_rev == roi_rev)
            .map(|c| &c.statistics)
    }

    /// Temperature under the global calibration at pixel `(x, y)`,
    /// `None` outside the image.
    pub fn temperature_at(&mut self, x: usize, y: usize) -> Result<Option<f64>> {
        Ok(self.temperatures()?.get(x, y))
    }

    /// Lowest and highest defined temperature of the image.
    pub fn temperature_range(&mut self) -> Result<Option<(f64, f64)>> {
        Ok(self.temperatures()?.range())
    }

    pub fn export_rows(&mut self) -> Result<Vec<ExportRow>> {
        let stats = self.all_statistics()?;
        let global = self.session.calibration.emissivity;
        Ok(self
            .session
            .rois
            .iter()
            .zip(stats)
            .map(|(roi, (_, statistics))| ExportRow {
                id: roi.id,
                name: roi.name.clone(),
                kind: roi.kind(),
                emissivity: roi.emissivity.unwrap_or(global),
                emissivity_overridden: roi.emissivity.is_some(),
                statistics,
            })
            .collect())
    }
}
