//! Token-bucket throttling of blob operations.
//!
//! A [`Throttler`] keeps one bucket per operation class:
//!
//! - **reads** - `GetBlob`
//! - **writes** - `PutBlob` and `DeleteBlob`
//! - **lists** - `ListBlobs`
//! - **upload bytes** / **download bytes** - payload sizes
//!
//! Each bucket holds up to `rate * window` tokens and is replenished
//! continuously. Limits can be swapped at runtime with
//! [`Throttler::set_limits`], which also notifies a registered persistence
//! callback. [`ThrottlingWrapper`] applies a throttler to a storage.

mod bucket;
mod throttler;
mod wrapper;

use serde::{Deserialize, Serialize};

pub use throttler::{BucketKind, Throttler, ThrottlerError, UpdateCallback};
pub use wrapper::ThrottlingWrapper;

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// Named per-second quotas. A zero rate means "no limit".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Limits {
    #[serde(skip_serializing_if = "is_zero")]
    pub reads_per_second: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub writes_per_second: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub lists_per_second: f64,
    #[serde(
        rename = "maxUploadSpeedBytesPerSecond",
        skip_serializing_if = "is_zero"
    )]
    pub upload_bytes_per_second: f64,
    #[serde(
        rename = "maxDownloadSpeedBytesPerSecond",
        skip_serializing_if = "is_zero"
    )]
    pub download_bytes_per_second: f64,
}

impl Limits {
    /// Rate configured for a bucket.
    pub fn rate(&self, kind: BucketKind) -> f64 {
        match kind {
            BucketKind::Reads => self.reads_per_second,
            BucketKind::Writes => self.writes_per_second,
            BucketKind::Lists => self.lists_per_second,
            BucketKind::UploadBytes => self.upload_bytes_per_second,
            BucketKind::DownloadBytes => self.download_bytes_per_second,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        BucketKind::ALL.iter().all(|k| self.rate(*k) == 0.0)
    }

    /// Every rate must be finite and non-negative.
    pub fn validate(&self) -> Result<(), ThrottlerError> {
        for kind in BucketKind::ALL {
            let rate = self.rate(kind);
            if !rate.is_finite() || rate < 0.0 {
                return Err(ThrottlerError::InvalidLimits(format!(
                    "{} must be a non-negative number, got {}",
                    kind.as_str(),
                    rate
                )));
            }
        }
        Ok(())
    }
}

/// What the throttling wrapper does when a bucket is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleMode {
    /// Block the caller until tokens are available
    #[default]
    Wait,
    /// Fail the call with `BlobError::Throttled`
    Reject,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_json_field_names() {
        let limits = Limits {
            reads_per_second: 5.0,
            upload_bytes_per_second: 1024.0,
            ..Default::default()
        };
        let v = serde_json::to_value(limits).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "readsPerSecond": 5.0,
                "maxUploadSpeedBytesPerSecond": 1024.0,
            })
        );

        let parsed: Limits =
            serde_json::from_value(serde_json::json!({"listsPerSecond": 3, "other": true}))
                .unwrap();
        assert_eq!(parsed.lists_per_second, 3.0);
        assert_eq!(parsed.reads_per_second, 0.0);
    }

    #[test]
    fn test_validate_rejects_negative_and_nan() {
        assert!(Limits::default().validate().is_ok());
        let negative = Limits {
            writes_per_second: -1.0,
            ..Default::default()
        };
        assert!(negative.validate().is_err());
        let nan = Limits {
            reads_per_second: f64::NAN,
            ..Default::default()
        };
        assert!(nan.validate().is_err());
    }
}
