use crate::engine::{EngineError, EngineHandle};
use faceid_core::{CameraError, CaptureError};
use zbus::interface;

/// D-Bus interface for the face capture daemon.
///
/// Bus name: org.faceid.FaceId1
/// Object path: /org/faceid/FaceId1
pub struct FaceIdService {
    engine: EngineHandle,
}

impl FaceIdService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.faceid.FaceId1")]
impl FaceIdService {
    /// Run guided capture and enroll the aggregate for `identity`.
    /// Returns a JSON summary of the session and the backend verdict.
    async fn enroll(&self, identity: &str) -> zbus::fdo::Result<String> {
        if identity.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "identity cannot be empty".into(),
            ));
        }
        tracing::info!(identity, "enroll requested");

        let result = self
            .engine
            .enroll(identity.to_string())
            .await
            .map_err(to_fdo)?;
        serde_json::to_string(&result).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Capture frontal samples and ask the backend to log the face in.
    async fn verify(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("verify requested");
        let result = self.engine.verify().await.map_err(to_fdo)?;
        tracing::info!(
            success = result.verdict.success,
            submitted = result.submitted,
            "verify complete"
        );
        Ok(result.verdict.success)
    }

    /// Cancel the capture in progress. Returns false if idle.
    async fn cancel(&self) -> zbus::fdo::Result<bool> {
        Ok(self.engine.cancel())
    }

    /// Return daemon status and capture progress as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let report = self.engine.status();
        let mut value =
            serde_json::to_value(&report).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        value["version"] = serde_json::json!(env!("CARGO_PKG_VERSION"));
        Ok(value.to_string())
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    tracing::warn!(error = %err, "request failed");
    match &err {
        EngineError::Camera(CameraError::PermissionDenied(_))
        | EngineError::Capture(CaptureError::Camera(CameraError::PermissionDenied(_))) => {
            zbus::fdo::Error::AccessDenied(err.to_string())
        }
        EngineError::Camera(CameraError::DeviceNotFound(_))
        | EngineError::Capture(CaptureError::Camera(CameraError::DeviceNotFound(_))) => {
            zbus::fdo::Error::FileNotFound(err.to_string())
        }
        _ => zbus::fdo::Error::Failed(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_maps_to_access_denied() {
        let err = EngineError::Camera(CameraError::PermissionDenied("/dev/video0".into()));
        assert!(matches!(to_fdo(err), zbus::fdo::Error::AccessDenied(_)));
    }

    #[test]
    fn test_missing_device_maps_to_file_not_found() {
        let err = EngineError::Capture(CaptureError::Camera(CameraError::DeviceNotFound(
            "/dev/video4".into(),
        )));
        assert!(matches!(to_fdo(err), zbus::fdo::Error::FileNotFound(_)));
    }

    #[test]
    fn test_no_usable_captures_is_generic_failure() {
        let err = EngineError::Capture(CaptureError::NoUsableCaptures);
        match to_fdo(err) {
            zbus::fdo::Error::Failed(msg) => assert!(msg.contains("no usable face captures")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
