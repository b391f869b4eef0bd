use crate::util::{command_exists, run_command};
use anyhow::{bail, Context, Result};
use image::{DynamicImage, GrayImage, ImageFormat};
use std::io::Cursor;
use std::time::Duration;

/// Characters the numeric readouts can contain.
pub const NUMERIC_WHITELIST: &str = "0123456789/:$";

/// Pluggable text-recognition engine.
pub trait TextRecognizer {
    fn name(&self) -> &str;

    /// Recognizes a single line of text restricted to `whitelist`.
    fn recognize(&self, image: &GrayImage, whitelist: &str) -> Result<String>;
}

/// Runs the `tesseract` binary, piping the crop through stdin.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    binary: String,
    timeout: Duration,
}

impl TesseractCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Returns the engine only when the binary is on `PATH`.
    pub fn detect(binary: &str) -> Option<Self> {
        if command_exists(binary) {
            Some(Self::new(binary))
        } else {
            log::warn!("{binary} not found; OCR reads will be empty");
            None
        }
    }
}

impl TextRecognizer for TesseractCli {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn recognize(&self, image: &GrayImage, whitelist: &str) -> Result<String> {
        let mut png = Vec::new();
        DynamicImage::ImageLuma8(image.clone())
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context("failed to encode OCR crop")?;

        let args = vec![
            "stdin".to_string(),
            "stdout".to_string(),
            "--psm".to_string(),
            "7".to_string(),
            "-c".to_string(),
            format!("tessedit_char_whitelist={whitelist}"),
        ];
        let output = run_command(&self.binary, &args, Some(&png), self.timeout)?;
        if !output.success {
            bail!(
                "tesseract exited with {:?}: {}",
                output.code,
                output.stderr
            );
        }
        Ok(output.stdout_text())
    }
}
