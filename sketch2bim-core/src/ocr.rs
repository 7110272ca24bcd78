use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage, ImageFormat};
use std::io::{Cursor, Write};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Text recognition over a grayscale region. Failures yield an empty string.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, region: &GrayImage) -> String;

    fn is_available(&self) -> bool;
}

/// Runs an external `tesseract` binary, feeding the region as PNG on stdin
pub struct TesseractOcr {
    binary: String,
    available: OnceLock<bool>,
}

impl TesseractOcr {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            available: OnceLock::new(),
        }
    }

    fn run(&self, region: &GrayImage) -> Result<String> {
        let mut png = Vec::new();
        DynamicImage::ImageLuma8(region.clone())
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context("Failed to encode OCR region")?;

        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "--psm", "6"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.binary))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&png).context("Failed to send image to OCR")?;
        }

        let output = child.wait_with_output().context("OCR process failed")?;
        if !output.status.success() {
            anyhow::bail!("OCR exited with {}", output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl OcrEngine for TesseractOcr {
    fn recognize(&self, region: &GrayImage) -> String {
        if !self.is_available() || region.width() == 0 || region.height() == 0 {
            return String::new();
        }
        match self.run(region) {
            Ok(text) => text,
            Err(e) => {
                warn!("OCR failed: {:#}", e);
                String::new()
            }
        }
    }

    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| {
            let ok = Command::new(&self.binary)
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if !ok {
                debug!("OCR binary {} not available", self.binary);
            }
            ok
        })
    }
}

/// OCR disabled
pub struct NoOcr;

impl OcrEngine for NoOcr {
    fn recognize(&self, _region: &GrayImage) -> String {
        String::new()
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_degrades_to_empty_text() {
        let ocr = TesseractOcr::new(format!("no-such-ocr-{}", uuid::Uuid::new_v4()));
        assert!(!ocr.is_available());
        assert_eq!(ocr.recognize(&GrayImage::new(10, 10)), "");
    }

    #[test]
    fn test_no_ocr() {
        assert!(!NoOcr.is_available());
        assert!(NoOcr.recognize(&GrayImage::new(4, 4)).is_empty());
    }
}
