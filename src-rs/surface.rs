use crate::classifier::{Recognition, RegionClassifier};
use crate::config::{Point, Region};
use crate::device::DeviceAdapter;
use crate::session::{Flow, Session};
use crate::util::timestamp_millis;
use image::DynamicImage;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// The loop's only path to the device.
///
/// Every device action first passes the session's suspend point, so a
/// paused or stopped session issues nothing. Adapter errors are logged and
/// the action becomes a no-op for that tick.
pub struct Surface<D: DeviceAdapter> {
    device: D,
    classifier: RegionClassifier,
    pub session: Session,
    archive_dir: Option<PathBuf>,
    taps: u64,
    captures: u64,
}

impl<D: DeviceAdapter> Surface<D> {
    pub fn new(device: D, classifier: RegionClassifier, session: Session) -> Self {
        Self {
            device,
            classifier,
            session,
            archive_dir: None,
            taps: 0,
            captures: 0,
        }
    }

    /// Also writes every capture as `screenshot_<millis>.png` into `dir`.
    pub fn with_archive(mut self, dir: Option<PathBuf>) -> Self {
        self.archive_dir = dir;
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn classifier(&self) -> &RegionClassifier {
        &self.classifier
    }

    pub fn taps(&self) -> u64 {
        self.taps
    }

    pub fn captures(&self) -> u64 {
        self.captures
    }

    pub fn checkpoint(&mut self) -> Flow {
        self.session.checkpoint()
    }

    pub fn wait(&mut self, duration: Duration) -> Flow {
        self.session.wait(duration)
    }

    /// Taps `point`, then lets the screen settle for `settle`.
    pub fn tap(&mut self, point: Point, settle: Duration) -> Flow {
        self.session.checkpoint()?;
        self.taps += 1;
        match self.device.tap(point.x, point.y) {
            Ok(true) => log::debug!("tap {point}"),
            Ok(false) => log::warn!("tap {point} rejected by {}", self.device.name()),
            Err(err) => log::warn!("tap {point} failed: {err:#}"),
        }
        self.session.wait(settle)
    }

    pub fn capture(&mut self) -> Flow<Option<DynamicImage>> {
        self.session.checkpoint()?;
        self.captures += 1;
        let image = match self.device.capture_screenshot() {
            Ok(Some(image)) => image,
            Ok(None) => {
                log::warn!("{} returned no screenshot", self.device.name());
                return Ok(None);
            }
            Err(err) => {
                log::warn!("screenshot failed: {err:#}");
                return Ok(None);
            }
        };
        if let Some(dir) = &self.archive_dir {
            let path = dir.join(format!("screenshot_{}.png", timestamp_millis()));
            if let Err(err) = fs::create_dir_all(dir).and_then(|_| {
                image.save(&path).map_err(std::io::Error::other)
            }) {
                log::warn!("could not archive {}: {err}", path.display());
            }
        }
        Ok(Some(image))
    }

    /// Fresh capture, then the dominant-hue test on `region`.
    pub fn is_active(&mut self, region: Region) -> Flow<bool> {
        let image = self.capture()?;
        Ok(self.classifier.classify_color(image.as_ref(), region))
    }

    /// Fresh capture, then OCR on `region`.
    pub fn read(&mut self, region: Region) -> Flow<Recognition> {
        let image = self.capture()?;
        let read = self.classifier.recognize_text(image.as_ref(), region);
        log::debug!("ocr {region}: {:?}", read.text);
        Ok(read)
    }
}
