// src/operation/bed_level.rs - Interactive per-corner bed height calibration
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};

use super::{Lifecycle, Operation, OperationError, OperationKind, OperationStage};
use crate::gcode::helpers;
use crate::geometry::Vector3;
use crate::parameters::BedLevelOffsets;
use crate::printer::compensation::BedRectangle;
use crate::printer::{Context, ContextOptions, Printer};

const EVENT_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BedCorner {
    BackLeft,
    BackRight,
    FrontRight,
    FrontLeft,
    Center,
}

impl BedCorner {
    pub const SEQUENCE: [BedCorner; 4] =
        [BedCorner::BackLeft, BedCorner::BackRight, BedCorner::FrontRight, BedCorner::FrontLeft];

    /// Where the nozzle is parked to measure this point.
    pub fn position(self, area: &BedRectangle) -> (f64, f64) {
        match self {
            BedCorner::BackLeft => (area.min_x, area.max_y),
            BedCorner::BackRight => (area.max_x, area.max_y),
            BedCorner::FrontRight => (area.max_x, area.min_y),
            BedCorner::FrontLeft => (area.min_x, area.min_y),
            BedCorner::Center => area.center(),
        }
    }
}

impl fmt::Display for BedCorner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BedCorner::BackLeft => "back left",
            BedCorner::BackRight => "back right",
            BedCorner::FrontRight => "front right",
            BedCorner::FrontLeft => "front left",
            BedCorner::Center => "center",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BedLevelSettings {
    /// Z change per up/down adjustment.
    pub step: f64,
    pub measure_center: bool,
    pub travel_feed_rate: f64,
    pub z_feed_rate: f64,
}

impl Default for BedLevelSettings {
    fn default() -> Self {
        Self { step: 0.05, measure_center: false, travel_feed_rate: 3000.0, z_feed_rate: 600.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BedLevelEvent {
    Moving(BedCorner),
    /// Holding at `corner`; waiting for adjustments.
    AtCorner { corner: BedCorner, z: f64 },
    Adjusted { corner: BedCorner, z: f64 },
    Finished(BedLevelOffsets),
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Request {
    Adjust(f64),
    Continue,
}

/// Measured nozzle heights, turned into offsets.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CornerLevels {
    pub back_left: f64,
    pub back_right: f64,
    pub front_right: f64,
    pub front_left: f64,
    pub center: Option<f64>,
}

impl CornerLevels {
    fn record(&mut self, corner: BedCorner, z: f64) {
        match corner {
            BedCorner::BackLeft => self.back_left = z,
            BedCorner::BackRight => self.back_right = z,
            BedCorner::FrontRight => self.front_right = z,
            BedCorner::FrontLeft => self.front_left = z,
            BedCorner::Center => self.center = Some(z),
        }
    }

    /// Each corner becomes `level - height_target`. A measured center turns
    /// into the common offset that makes the center come out right; without
    /// one the previous common offset is kept.
    pub fn offsets(&self, height_target: f64, previous_common: f64) -> BedLevelOffsets {
        let back_left = self.back_left - height_target;
        let back_right = self.back_right - height_target;
        let front_right = self.front_right - height_target;
        let front_left = self.front_left - height_target;
        let common = match self.center {
            Some(center) => {
                let mean = (back_left + back_right + front_right + front_left) / 4.0;
                center - height_target - mean
            }
            None => previous_common,
        };
        BedLevelOffsets { common, back_left, back_right, front_right, front_left }
    }
}

struct Inner {
    lifecycle: Lifecycle,
    settings: BedLevelSettings,
    events: broadcast::Sender<BedLevelEvent>,
    requests: mpsc::UnboundedSender<Request>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
}

/// Walks the nozzle to each corner and lets the user lower it onto the bed.
#[derive(Clone)]
pub struct BedLevelCalibration {
    inner: Arc<Inner>,
}

impl BedLevelCalibration {
    pub fn new(settings: BedLevelSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (requests, pending) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                lifecycle: Lifecycle::new(OperationKind::Calibration),
                settings,
                events,
                requests,
                pending: Mutex::new(Some(pending)),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BedLevelEvent> {
        self.inner.events.subscribe()
    }

    /// Begin at `start_z` above each point. `height_target` is the nozzle
    /// height the user is leveling to, e.g. the thickness of a sheet of paper.
    pub fn start_at_level(&self, printer: &Printer, start_z: f64, height_target: f64) -> Result<(), OperationError> {
        let requests = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(OperationError::AlreadyStarted)?;
        let context = self.inner.lifecycle.begin(printer, ContextOptions::exclusive().without_compensation())?;
        let area = printer.options().bed_area;
        tracing::info!("Starting bed level calibration at Z {:.2}, target {:.2}", start_z, height_target);
        tokio::spawn(self.inner.clone().run(context, requests, area, start_z, height_target));
        Ok(())
    }

    pub fn adjust_up(&self) -> Result<(), OperationError> {
        self.request(Request::Adjust(self.inner.settings.step))
    }

    pub fn adjust_down(&self) -> Result<(), OperationError> {
        self.request(Request::Adjust(-self.inner.settings.step))
    }

    /// Accept the current height and move on to the next point.
    pub fn continue_(&self) -> Result<(), OperationError> {
        self.request(Request::Continue)
    }

    fn request(&self, request: Request) -> Result<(), OperationError> {
        if self.inner.lifecycle.stage() != OperationStage::Running {
            return Err(OperationError::NotRunning);
        }
        self.inner.requests.send(request).map_err(|_| OperationError::NotRunning)
    }
}

impl Operation for BedLevelCalibration {
    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    fn activity_description(&self) -> String {
        "Calibrating bed level".to_string()
    }
}

impl Inner {
    fn emit(&self, event: BedLevelEvent) {
        let _ = self.events.send(event);
    }

    async fn run(
        self: Arc<Self>,
        context: Context,
        mut requests: mpsc::UnboundedReceiver<Request>,
        area: BedRectangle,
        start_z: f64,
        height_target: f64,
    ) {
        let result = tokio::select! {
            result = self.calibrate(&context, &mut requests, area, start_z, height_target) => result,
            _ = self.lifecycle.stop_requested() => Ok(None),
        };
        self.lifecycle.set_stage(OperationStage::Ending);
        match result {
            Ok(Some(offsets)) => {
                tracing::info!("Bed level calibration finished: {}", offsets);
                self.emit(BedLevelEvent::Finished(offsets));
            }
            Ok(None) => {
                tracing::info!("Bed level calibration cancelled");
                self.emit(BedLevelEvent::Cancelled);
            }
            Err(e) => {
                tracing::error!("Bed level calibration failed: {}", e);
                self.emit(BedLevelEvent::Failed(e.to_string()));
            }
        }
        if let Err(e) = self.raise(&context, start_z).await {
            tracing::debug!("Could not raise the head after calibration: {}", e);
        }
        self.lifecycle.finish(context);
    }

    async fn calibrate(
        &self,
        context: &Context,
        requests: &mut mpsc::UnboundedReceiver<Request>,
        area: BedRectangle,
        start_z: f64,
        height_target: f64,
    ) -> Result<Option<BedLevelOffsets>, OperationError> {
        let previous = context.fetch_bed_offsets().await?;
        context.set_relative_mode(false).await?;
        self.lifecycle.set_stage(OperationStage::Running);

        let mut points = BedCorner::SEQUENCE.to_vec();
        if self.settings.measure_center {
            points.push(BedCorner::Center);
        }

        let mut levels = CornerLevels::default();
        for corner in points {
            self.emit(BedLevelEvent::Moving(corner));
            let (x, y) = corner.position(&area);
            self.raise(context, start_z).await?;
            context.move_to(&Vector3::xy(x, y), self.settings.travel_feed_rate).await?;
            let mut z = start_z;
            self.emit(BedLevelEvent::AtCorner { corner, z });

            loop {
                match requests.recv().await {
                    Some(Request::Adjust(delta)) => {
                        z += delta;
                        context.move_to(&Vector3::z(z), self.settings.z_feed_rate).await?;
                        tracing::debug!("{} adjusted to Z {:.2}", corner, z);
                        self.emit(BedLevelEvent::Adjusted { corner, z });
                    }
                    Some(Request::Continue) => break,
                    None => return Ok(None),
                }
            }
            tracing::info!("{} level is {:.2}", corner, z);
            levels.record(corner, z);
        }

        let offsets = levels.offsets(height_target, previous.common);
        context.set_bed_offsets(offsets).await?;
        Ok(Some(offsets))
    }

    async fn raise(&self, context: &Context, z: f64) -> Result<(), OperationError> {
        context.execute(helpers::move_to(&Vector3::z(z), Some(self.settings.z_feed_rate))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_without_center_keep_common() {
        let levels = CornerLevels { back_left: 1.1, back_right: 1.3, front_right: 0.9, front_left: 1.0, center: None };
        let offsets = levels.offsets(0.1, 0.25);
        assert!((offsets.back_left - 1.0).abs() < 1e-9);
        assert!((offsets.back_right - 1.2).abs() < 1e-9);
        assert!((offsets.front_right - 0.8).abs() < 1e-9);
        assert!((offsets.front_left - 0.9).abs() < 1e-9);
        assert_eq!(offsets.common, 0.25);
    }

    #[test]
    fn test_center_sets_common() {
        let levels = CornerLevels {
            back_left: 1.0,
            back_right: 1.0,
            front_right: 2.0,
            front_left: 2.0,
            center: Some(1.8),
        };
        let offsets = levels.offsets(0.0, 0.25);
        assert!((offsets.common - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_corner_positions() {
        let area = BedRectangle::inset(109.0, 113.0, 9.0);
        assert_eq!(BedCorner::BackLeft.position(&area), (9.0, 104.0));
        assert_eq!(BedCorner::FrontRight.position(&area), (100.0, 9.0));
        assert_eq!(BedCorner::Center.position(&area), (54.5, 56.5));
    }
}
