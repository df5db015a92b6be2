//! Debug dumps written when a repository connection closes.
//!
//! Enabled through `STRONGBOX_DEBUG_DUMP`, a `:`-separated list of dump
//! names each optionally followed by `=` and `,`-separated flags:
//!
//! ```text
//! STRONGBOX_DEBUG_DUMP=metrics:throttle=debug=1
//! ```
//!
//! Known dumps are `metrics` (per-method blob counters) and `throttle`
//! (limits and bucket levels). Each one is written to stderr as a PEM block
//! wrapping a JSON document. `debug=N` with N > 0 pretty-prints the JSON.

use std::collections::BTreeMap;
use std::io::Write;

use blob::metrics::MetricsRegistry;
use blob::throttling::{BucketKind, Throttler};
use serde_json::{json, Value};

pub const DEBUG_DUMP_ENV: &str = "STRONGBOX_DEBUG_DUMP";

pub const METRICS_DUMP: &str = "metrics";
pub const THROTTLE_DUMP: &str = "throttle";

const DEBUG_FLAG: &str = "debug";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DumpConfigError {
    #[error("empty debug dump name")]
    EmptyName,
    #[error("invalid {flag} value {value:?} for dump {name}")]
    InvalidFlag {
        name: String,
        flag: &'static str,
        value: String,
    },
}

/// Flags given to a single dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpConfig {
    flags: Vec<String>,
}

impl DumpConfig {
    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    /// Value of `key=value` among the flags. A bare `key` yields `""`.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.flags.iter().find_map(|flag| match flag.split_once('=') {
            Some((k, v)) if k == key => Some(v),
            None if flag == key => Some(""),
            _ => None,
        })
    }
}

/// Parsed `STRONGBOX_DEBUG_DUMP`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpConfigs(BTreeMap<String, DumpConfig>);

impl DumpConfigs {
    pub fn parse(s: &str) -> Result<Self, DumpConfigError> {
        let mut configs = BTreeMap::new();
        for part in s.split(':') {
            let (name, flags) = match part.split_once('=') {
                Some((name, flags)) => (name, Some(flags)),
                None => (part, None),
            };
            if name.is_empty() {
                return Err(DumpConfigError::EmptyName);
            }
            let flags = flags
                .map(|f| {
                    f.split(',')
                        .filter(|f| !f.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            configs.insert(name.to_string(), DumpConfig { flags });
        }
        Ok(Self(configs))
    }

    /// Dumps requested through the environment. Unset or empty means none;
    /// a malformed value is logged and ignored.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(DEBUG_DUMP_ENV).ok().filter(|v| !v.is_empty())?;
        match Self::parse(&raw) {
            Ok(configs) => Some(configs),
            Err(e) => {
                tracing::warn!(value = %raw, error = %e, "ignoring {DEBUG_DUMP_ENV}");
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&DumpConfig> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The `debug=N` level of a dump, 0 when absent.
pub fn debug_level(name: &str, config: &DumpConfig) -> Result<u32, DumpConfigError> {
    match config.value(DEBUG_FLAG) {
        None => Ok(0),
        Some(v) => v.parse().map_err(|_| DumpConfigError::InvalidFlag {
            name: name.to_string(),
            flag: DEBUG_FLAG,
            value: v.to_string(),
        }),
    }
}

/// Write `data` as a PEM block labelled `tag`, followed by a blank line.
pub fn dump_pem(data: &[u8], tag: &str, w: &mut dyn Write) -> std::io::Result<()> {
    let block = pem::encode_config(
        &pem::Pem::new(tag, data),
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    );
    w.write_all(block.as_bytes())?;
    w.write_all(b"\n")
}

fn metrics_document(metrics: &MetricsRegistry) -> Value {
    let methods: serde_json::Map<String, Value> = metrics
        .snapshot()
        .into_iter()
        .map(|(method, stats)| {
            (
                method.to_string(),
                json!({
                    "calls": stats.calls,
                    "errors": stats.errors,
                    "bytes": stats.bytes,
                    "durationSecs": stats.total_duration.as_secs_f64(),
                }),
            )
        })
        .collect();
    Value::Object(methods)
}

fn throttle_document(throttler: &Throttler) -> Value {
    let buckets: serde_json::Map<String, Value> = BucketKind::ALL
        .iter()
        .map(|kind| {
            (
                kind.as_str().to_string(),
                json!({
                    "capacity": throttler.capacity(*kind),
                    "available": throttler.available(*kind),
                }),
            )
        })
        .collect();
    json!({
        "limits": throttler.limits(),
        "buckets": buckets,
    })
}

/// Write every known dump in `configs` to `w`. Unknown names are skipped.
/// Returns the number of blocks written.
pub fn write_dumps(
    configs: &DumpConfigs,
    metrics: &MetricsRegistry,
    throttler: &Throttler,
    w: &mut dyn Write,
) -> std::io::Result<usize> {
    let mut written = 0;
    for name in configs.names() {
        let doc = match name {
            METRICS_DUMP => metrics_document(metrics),
            THROTTLE_DUMP => throttle_document(throttler),
            other => {
                tracing::debug!(dump = other, "unknown debug dump");
                continue;
            }
        };

        let level = configs
            .get(name)
            .map(|c| debug_level(name, c))
            .transpose()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "using default debug level");
                None
            })
            .unwrap_or(0);
        let body = if level > 0 {
            serde_json::to_vec_pretty(&doc)
        } else {
            serde_json::to_vec(&doc)
        }
        .map_err(std::io::Error::other)?;

        dump_pem(&body, &format!("STRONGBOX {}", name.to_uppercase()), w)?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use blob::throttling::Limits;

    use super::*;

    #[test]
    fn test_parse_names_and_flags() {
        let configs = DumpConfigs::parse("foo=bar:first=one=1,two=2:second:third").unwrap();
        assert_eq!(configs.len(), 4);
        assert_eq!(configs.get("foo").unwrap().flags(), ["bar"]);
        assert_eq!(configs.get("first").unwrap().flags(), ["one=1", "two=2"]);
        assert!(configs.get("second").unwrap().flags().is_empty());
        assert!(configs.get("third").unwrap().flags().is_empty());

        // only the first `=` separates the name
        let configs = DumpConfigs::parse("first=one=1").unwrap();
        assert_eq!(configs.get("first").unwrap().value("one"), Some("1"));

        let configs = DumpConfigs::parse(",").unwrap();
        assert!(configs.get(",").unwrap().flags().is_empty());
    }

    #[test]
    fn test_empty_names_are_rejected() {
        for input in ["", "=", ":", "=,:", ":=", "metrics:"] {
            assert_eq!(
                DumpConfigs::parse(input),
                Err(DumpConfigError::EmptyName),
                "{input:?}"
            );
        }
    }

    #[test]
    fn test_flag_values() {
        let config = DumpConfig {
            flags: vec!["foo=bar".into(), "empty=".into(), "bare".into()],
        };
        assert_eq!(config.value("foo"), Some("bar"));
        assert_eq!(config.value("empty"), Some(""));
        assert_eq!(config.value("bare"), Some(""));
        assert_eq!(config.value("bar"), None);
    }

    #[test]
    fn test_debug_level() {
        let configs = DumpConfigs::parse("throttle=rate=10:metrics=debug=10:other=debug=x").unwrap();
        assert_eq!(debug_level("throttle", configs.get("throttle").unwrap()), Ok(0));
        assert_eq!(debug_level("metrics", configs.get("metrics").unwrap()), Ok(10));
        assert!(matches!(
            debug_level("other", configs.get("other").unwrap()),
            Err(DumpConfigError::InvalidFlag { .. })
        ));
    }

    #[test]
    fn test_dump_pem_layout() {
        let mut out = Vec::new();
        dump_pem(b"this is a sample PEM", "test", &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "-----BEGIN test-----\ndGhpcyBpcyBhIHNhbXBsZSBQRU0=\n-----END test-----\n\n"
        );
    }

    #[tokio::test]
    async fn test_write_dumps_skips_unknown_names() {
        let metrics = MetricsRegistry::new();
        metrics.record("PutBlob", 42, Duration::from_millis(5), false);
        let throttler = Throttler::new(
            Limits {
                reads_per_second: 2.0,
                ..Default::default()
            },
            Duration::from_secs(60),
            0.5,
        )
        .unwrap();

        let configs = DumpConfigs::parse("metrics:throttle=debug=1:nonelikethis=foo").unwrap();
        let mut out = Vec::new();
        let written = write_dumps(&configs, &metrics, &throttler, &mut out).unwrap();
        assert_eq!(written, 2);

        let blocks = pem::parse_many(&out).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].tag(), "STRONGBOX METRICS");
        assert_eq!(blocks[1].tag(), "STRONGBOX THROTTLE");

        let doc: Value = serde_json::from_slice(blocks[0].contents()).unwrap();
        assert_eq!(doc["PutBlob"]["bytes"], 42);
        let doc: Value = serde_json::from_slice(blocks[1].contents()).unwrap();
        assert_eq!(doc["limits"]["readsPerSecond"], 2.0);
        assert_eq!(doc["buckets"]["readsPerSecond"]["capacity"], 120.0);
    }
}
