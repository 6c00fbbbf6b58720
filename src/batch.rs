//! Applying one session to many captures.
//!
//! The session's ROIs and user-editable environment are applied to
//! every capture, while each capture keeps its own Planck constants
//! and alignment. Captures are processed on rayon's pool and fail
//! independently of each other.
use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::prelude::*;
use serde_derive::*;
use tracing::{info, warn};

use crate::{
    error::Result,
    exif::{Capture, ExiftoolCapture},
    session::Session,
    workspace::{ExportRow, Workspace},
};

/// Something that can be turned into a decoded capture.
pub trait IntoCapture {
    fn into_capture(self) -> Result<Capture>;
}

impl IntoCapture for Capture {
    fn into_capture(self) -> Result<Capture> {
        Ok(self)
    }
}

impl IntoCapture for ExiftoolCapture {
    fn into_capture(self) -> Result<Capture> {
        ExiftoolCapture::into_capture(self)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BatchOptions {
    /// Skip the captures not yet started once one has failed.
    pub abort_on_error: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ImageReport {
    pub source: Option<String>,
    pub width: usize,
    pub height: usize,
    /// Lowest and highest defined temperature of the image.
    pub temperature_range: Option<(f64, f64)>,
    pub rois: Vec<ExportRow>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Done(ImageReport),
    Failed { error: String },
    /// Not started because the batch was aborted.
    Skipped,
}

fn report(session: &Session, capture: Capture) -> Result<ImageReport> {
    let Capture {
        source,
        intensity,
        calibration,
    } = capture;
    let session = Session {
        image: source.clone(),
        calibration: calibration.with_environment_of(&session.calibration),
        ..session.clone()
    };
    let (width, height) = (intensity.width(), intensity.height());
    let mut ws = Workspace::new(intensity, session, None)?;
    Ok(ImageReport {
        source,
        width,
        height,
        temperature_range: ws.temperature_range()?,
        rois: ws.export_rows()?,
    })
}

/// Computes the ROI statistics of `session` on every capture.
/// Returns one outcome per capture, in input order.
///
/// Captures not yet started when `abort` is raised are skipped;
/// with [`BatchOptions::abort_on_error`] a failure raises it.
pub fn apply_session<C>(
    session: &Session,
    captures: Vec<C>,
    options: BatchOptions,
    abort: &AtomicBool,
    progress: &ProgressBar,
) -> Vec<BatchOutcome>
where
    C: IntoCapture + Send,
{
    info!(captures = captures.len(), rois = session.rois.len(), "applying session");
    let outcomes: Vec<_> = captures
        .into_par_iter()
        .progress_with(progress.clone())
        .map(|capture| {
            if abort.load(Ordering::SeqCst) {
                return BatchOutcome::Skipped;
            }
            match capture.into_capture().and_then(|c| report(session, c)) {
                Ok(report) => BatchOutcome::Done(report),
                Err(e) => {
                    warn!("capture failed: {}", e);
                    if options.abort_on_error {
                        abort.store(true, Ordering::SeqCst);
                    }
                    BatchOutcome::Failed { error: e.to_string() }
                }
            }
        })
        .collect();
    progress.finish_and_clear();
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        raw::IntensityMatrix,
        roi::{Point, Roi, RoiGeometry},
        temperature::{CalibrationParameters, PlanckConstants},
    };
    use anyhow::Result;

    fn capture(name: &str, temp: f64) -> Capture {
        let calibration = CalibrationParameters {
            planck: PlanckConstants {
                r1: 17000.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let raw = calibration.planck.temp_to_raw(temp).round() as u16;
        Capture {
            source: Some(name.into()),
            intensity: IntensityMatrix::from_shape_vec(4, 3, vec![raw; 12]).unwrap(),
            calibration,
        }
    }

    fn broken(name: &str) -> Result<ExiftoolCapture> {
        Ok(serde_json::from_value(serde_json::json!({ "SourceFile": name }))?)
    }

    fn session() -> Session {
        let mut session = Session::new(
            None,
            CalibrationParameters {
                emissivity: 0.8,
                ..Default::default()
            },
        );
        session.rois.push(Roi::new(
            "ROI_1",
            RoiGeometry::Rectangle {
                a: Point::new(0., 0.),
                b: Point::new(1., 1.),
            },
        ));
        session
    }

    enum Input {
        Decoded(Capture),
        Exif(ExiftoolCapture),
    }

    impl IntoCapture for Input {
        fn into_capture(self) -> crate::Result<Capture> {
            match self {
                Input::Decoded(c) => Ok(c),
                Input::Exif(e) => e.into_capture(),
            }
        }
    }

    #[test]
    fn failures_are_isolated_and_order_kept() -> Result<()> {
        let inputs = vec![
            Input::Decoded(capture("a.jpg", 30.)),
            Input::Exif(broken("b.jpg")?),
            Input::Decoded(capture("c.jpg", 40.)),
        ];
        let abort = AtomicBool::new(false);
        let outcomes = apply_session(
            &session(),
            inputs,
            BatchOptions::default(),
            &abort,
            &ProgressBar::hidden(),
        );
        assert_eq!(outcomes.len(), 3);
        let source = |outcome: &BatchOutcome| match outcome {
            BatchOutcome::Done(r) => r.source.clone(),
            _ => None,
        };
        assert_eq!(source(&outcomes[0]).as_deref(), Some("a.jpg"));
        assert!(matches!(&outcomes[1], BatchOutcome::Failed { .. }));
        assert_eq!(source(&outcomes[2]).as_deref(), Some("c.jpg"));
        assert!(!abort.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn session_environment_with_capture_constants() {
        let session = session();
        let input = capture("a.jpg", 30.);
        let expected = input
            .calibration
            .with_environment_of(&session.calibration)
            .raw_to_temp(
                crate::temperature::CalibrationScope::Global,
                input.intensity.get(0, 0).unwrap() as f64,
            )
            .unwrap();

        let outcomes = apply_session(
            &session,
            vec![input],
            BatchOptions::default(),
            &AtomicBool::new(false),
            &ProgressBar::hidden(),
        );
        let report = match &outcomes[0] {
            BatchOutcome::Done(report) => report,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!((report.width, report.height), (4, 3));
        let row = &report.rois[0];
        assert_eq!(row.emissivity, 0.8);
        assert_eq!(row.statistics.pixel_count, 4);
        assert_eq!(row.statistics.min(), Some(expected));
        assert!((row.statistics.mean().unwrap() - expected).abs() < 1e-9);
        assert_eq!(report.temperature_range, Some((expected, expected)));
    }

    #[test]
    fn raised_abort_skips_everything() {
        let abort = AtomicBool::new(true);
        let outcomes = apply_session(
            &session(),
            vec![capture("a.jpg", 30.), capture("b.jpg", 31.)],
            BatchOptions::default(),
            &abort,
            &ProgressBar::hidden(),
        );
        assert_eq!(outcomes, [BatchOutcome::Skipped, BatchOutcome::Skipped]);
    }

    #[test]
    fn abort_on_error_skips_the_rest() -> Result<()> {
        let inputs = vec![
            Input::Exif(broken("a.jpg")?),
            Input::Decoded(capture("b.jpg", 30.)),
            Input::Decoded(capture("c.jpg", 30.)),
        ];
        let abort = AtomicBool::new(false);
        // A single worker runs the captures in input order.
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build()?;
        let outcomes = pool.install(|| {
            apply_session(
                &session(),
                inputs,
                BatchOptions { abort_on_error: true },
                &abort,
                &ProgressBar::hidden(),
            )
        });
        assert!(matches!(outcomes[0], BatchOutcome::Failed { .. }));
        assert_eq!(outcomes[1..], [BatchOutcome::Skipped, BatchOutcome::Skipped]);
        assert!(abort.load(Ordering::SeqCst));
        Ok(())
    }
}
