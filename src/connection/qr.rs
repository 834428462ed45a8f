//! QR code lifecycle for pairing a new device.
//!
//! Holds at most one artifact. An artifact is only handed out while
//! `now < expires_at`; asking after that clears it.

use std::sync::Mutex;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use qrcode::render::{svg, unicode};
use qrcode::QrCode;
use thiserror::Error;

use crate::types::QrArtifact;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QrError {
    #[error("QR generation failed: {0}")]
    GenerationFailed(String),
}

/// Current pairing artifact, if any.
pub struct QrLifecycle {
    window: Duration,
    current: Mutex<Option<QrArtifact>>,
}

impl QrLifecycle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            current: Mutex::new(None),
        }
    }

    /// Render `value` and make it the current artifact.
    pub fn issue(&self, value: &str, now: DateTime<Utc>) -> Result<QrArtifact, QrError> {
        let artifact = render(value, now, self.window)?;
        *self.slot() = Some(artifact.clone());
        Ok(artifact)
    }

    /// The artifact, unless it has expired (in which case it is dropped).
    pub fn current_at(&self, now: DateTime<Utc>) -> Option<QrArtifact> {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|qr| qr.is_expired_at(now)) {
            *slot = None;
        }
        slot.clone()
    }

    pub fn current(&self) -> Option<QrArtifact> {
        self.current_at(Utc::now())
    }

    /// Discard the artifact; returns whether one was held.
    pub fn clear(&self) -> bool {
        self.slot().take().is_some()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<QrArtifact>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Render a pairing payload as an SVG data URL plus a terminal drawing.
pub fn render(value: &str, now: DateTime<Utc>, window: Duration) -> Result<QrArtifact, QrError> {
    let code =
        QrCode::new(value.as_bytes()).map_err(|e| QrError::GenerationFailed(e.to_string()))?;

    let svg = code
        .render::<svg::Color>()
        .min_dimensions(256, 256)
        .build();
    let terminal = code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build();

    let window = chrono::Duration::from_std(window)
        .map_err(|e| QrError::GenerationFailed(e.to_string()))?;

    Ok(QrArtifact {
        value: value.to_string(),
        image: format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg)),
        terminal,
        generated_at: now,
        expires_at: now + window,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_produces_both_forms() {
        let now = Utc::now();
        let qr = render("2@abc,def,ghi", now, Duration::from_secs(60)).unwrap();
        assert!(qr.image.starts_with("data:image/svg+xml;base64,"));
        assert!(!qr.terminal.is_empty());
        assert_eq!(qr.expires_at - qr.generated_at, chrono::Duration::seconds(60));
    }

    #[test]
    fn test_current_respects_window() {
        let qr = QrLifecycle::new(Duration::from_secs(60));
        let now = Utc::now();
        qr.issue("2@abc", now).unwrap();

        assert!(qr.current_at(now + chrono::Duration::seconds(59)).is_some());
        assert!(qr.current_at(now + chrono::Duration::seconds(60)).is_none());
        // expiry cleared it for good
        assert!(qr.current_at(now).is_none());
    }

    #[test]
    fn test_clear() {
        let qr = QrLifecycle::new(Duration::from_secs(60));
        assert!(!qr.clear());
        qr.issue("2@abc", Utc::now()).unwrap();
        assert!(qr.clear());
        assert!(qr.current().is_none());
    }
}
