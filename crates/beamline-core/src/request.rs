//! Scan requests and the schemas they are validated against.

use crate::error::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Queue used when a request does not name one.
pub const DEFAULT_QUEUE: &str = "primary";

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

/// A scan as submitted by a client. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Name of a registered scan type
    pub scan_type: String,
    /// Positional arguments, grouped in bundles by the scan type's schema
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
    /// Interpret motor targets relative to the current positions
    #[serde(default)]
    pub relative: bool,
    /// Target queue
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Free-form client metadata, echoed in scan status messages
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ScanRequest {
    /// Request for `scan_type` on the default queue with no arguments.
    pub fn new(scan_type: impl Into<String>) -> Self {
        Self {
            scan_type: scan_type.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            relative: false,
            queue: default_queue(),
            metadata: BTreeMap::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Set the relative flag.
    pub fn relative(mut self, relative: bool) -> Self {
        self.relative = relative;
        self
    }

    /// Target a queue.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Positional arguments split into bundles of `size`.
    pub fn bundles(&self, size: usize) -> Vec<&[Value]> {
        if size == 0 {
            return Vec::new();
        }
        self.args.chunks(size).collect()
    }

    /// Float keyword argument, falling back to `default` when absent.
    pub fn kwarg_f64(&self, key: &str, default: f64) -> f64 {
        self.kwargs
            .get(key)
            .and_then(Value::as_f64)
            .unwrap_or(default)
    }

    /// Integer keyword argument, falling back to `default` when absent.
    pub fn kwarg_u64(&self, key: &str, default: u64) -> u64 {
        self.kwargs
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or(default)
    }

    /// Boolean keyword argument, falling back to `default` when absent.
    pub fn kwarg_bool(&self, key: &str, default: bool) -> bool {
        self.kwargs
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// String keyword argument.
    pub fn kwarg_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(Value::as_str)
    }
}

/// Whether a scan walks a position table or lets a flyer acquire on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanCategory {
    /// Step scan driven point by point
    Step,
    /// Fly scan driven by a flyer
    Fly,
}

impl fmt::Display for ScanCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanCategory::Step => f.write_str("step"),
            ScanCategory::Fly => f.write_str("fly"),
        }
    }
}

/// Type of one positional or keyword argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgType {
    /// Name of a registered device
    Device,
    /// Any number
    Float,
    /// Non-negative integer
    Int,
    /// Boolean
    Bool,
    /// String
    Text,
}

impl ArgType {
    /// Whether `value` has this type.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ArgType::Device | ArgType::Text => value.is_string(),
            ArgType::Float => value.is_number(),
            ArgType::Int => value.is_u64(),
            ArgType::Bool => value.is_boolean(),
        }
    }
}

/// Bundle arity of the positional arguments.
///
/// Arguments come in bundles of `bundle` values; at least `min` and at most
/// `max` bundles are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSize {
    /// Values per bundle
    pub bundle: usize,
    /// Minimum number of bundles
    pub min: usize,
    /// Maximum number of bundles, unbounded when absent
    pub max: Option<usize>,
}

/// Argument schema of a scan type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSchema {
    /// Scan type name
    pub scan_type: String,
    /// Step or fly
    pub category: ScanCategory,
    /// Types of the values within one bundle
    pub arg_input: Vec<ArgType>,
    /// Bundle arity
    pub arg_bundle_size: BundleSize,
    /// Keyword arguments that must be present
    pub required_kwargs: BTreeMap<String, ArgType>,
    /// Keyword arguments that may be present
    pub optional_kwargs: BTreeMap<String, ArgType>,
}

impl ScanSchema {
    /// Schema taking no arguments at all.
    pub fn new(scan_type: impl Into<String>, category: ScanCategory) -> Self {
        Self {
            scan_type: scan_type.into(),
            category,
            arg_input: Vec::new(),
            arg_bundle_size: BundleSize {
                bundle: 0,
                min: 0,
                max: Some(0),
            },
            required_kwargs: BTreeMap::new(),
            optional_kwargs: BTreeMap::new(),
        }
    }

    /// Declare the bundle layout.
    pub fn bundle(mut self, arg_input: Vec<ArgType>, min: usize, max: Option<usize>) -> Self {
        self.arg_bundle_size = BundleSize {
            bundle: arg_input.len(),
            min,
            max,
        };
        self.arg_input = arg_input;
        self
    }

    /// Declare a required keyword argument.
    pub fn required(mut self, key: impl Into<String>, kind: ArgType) -> Self {
        self.required_kwargs.insert(key.into(), kind);
        self
    }

    /// Declare an optional keyword argument.
    pub fn optional(mut self, key: impl Into<String>, kind: ArgType) -> Self {
        self.optional_kwargs.insert(key.into(), kind);
        self
    }

    /// Validate a request against this schema.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an arity or bundle mismatch, a type mismatch, a
    /// device named twice, a missing required keyword or an undeclared
    /// keyword.
    pub fn validate(&self, request: &ScanRequest) -> ScanResult<()> {
        let invalid = |msg: String| Err(ScanError::InvalidRequest(format!("{}: {msg}", self.scan_type)));

        let size = self.arg_bundle_size;
        if size.bundle == 0 {
            if !request.args.is_empty() {
                return invalid(format!(
                    "takes no positional arguments, got {}",
                    request.args.len()
                ));
            }
        } else {
            if request.args.len() % size.bundle != 0 {
                return invalid(format!(
                    "expected arguments in bundles of {}, got {}",
                    size.bundle,
                    request.args.len()
                ));
            }
            let bundles = request.args.len() / size.bundle;
            if bundles < size.min {
                return invalid(format!(
                    "expected at least {} bundle(s), got {bundles}",
                    size.min
                ));
            }
            if let Some(max) = size.max {
                if bundles > max {
                    return invalid(format!("expected at most {max} bundle(s), got {bundles}"));
                }
            }
            let mut devices = BTreeSet::new();
            for (i, value) in request.args.iter().enumerate() {
                let expected = self.arg_input[i % size.bundle];
                if !expected.accepts(value) {
                    return invalid(format!("argument {i} expects {expected:?}, got {value}"));
                }
                if expected == ArgType::Device && !devices.insert(value.as_str().unwrap_or_default()) {
                    return invalid(format!("device {value} appears more than once"));
                }
            }
        }

        for (key, kind) in &self.required_kwargs {
            match request.kwargs.get(key) {
                None => return invalid(format!("missing required keyword '{key}'")),
                Some(value) if !kind.accepts(value) => {
                    return invalid(format!("keyword '{key}' expects {kind:?}, got {value}"))
                }
                Some(_) => {}
            }
        }
        for (key, value) in &request.kwargs {
            if self.required_kwargs.contains_key(key) {
                continue;
            }
            match self.optional_kwargs.get(key) {
                None => return invalid(format!("unexpected keyword '{key}'")),
                Some(kind) if !kind.accepts(value) => {
                    return invalid(format!("keyword '{key}' expects {kind:?}, got {value}"))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_scan_schema() -> ScanSchema {
        ScanSchema::new("line_scan", ScanCategory::Step)
            .bundle(vec![ArgType::Device, ArgType::Float, ArgType::Float], 1, None)
            .required("steps", ArgType::Int)
            .optional("settle_time", ArgType::Float)
    }

    #[test]
    fn valid_request_passes() {
        let req = ScanRequest::new("line_scan")
            .arg("samx")
            .arg(0.0)
            .arg(4.0)
            .kwarg("steps", 5);
        assert!(line_scan_schema().validate(&req).is_ok());
    }

    #[test]
    fn incomplete_bundle_is_rejected() {
        let req = ScanRequest::new("line_scan")
            .arg("samx")
            .arg(0.0)
            .kwarg("steps", 5);
        assert!(matches!(
            line_scan_schema().validate(&req),
            Err(ScanError::InvalidRequest(_))
        ));
    }

    #[test]
    fn wrong_argument_type_is_rejected() {
        let req = ScanRequest::new("line_scan")
            .arg(1.0)
            .arg(0.0)
            .arg(4.0)
            .kwarg("steps", 5);
        assert!(line_scan_schema().validate(&req).is_err());
    }

    #[test]
    fn missing_required_kwarg_is_rejected() {
        let req = ScanRequest::new("line_scan").arg("samx").arg(0.0).arg(4.0);
        let err = line_scan_schema().validate(&req).unwrap_err();
        assert!(err.to_string().contains("steps"));
    }

    #[test]
    fn unknown_kwarg_is_rejected() {
        let req = ScanRequest::new("line_scan")
            .arg("samx")
            .arg(0.0)
            .arg(4.0)
            .kwarg("steps", 5)
            .kwarg("speed", 3.0);
        assert!(line_scan_schema().validate(&req).is_err());
    }

    #[test]
    fn bundle_maximum_is_enforced() {
        let schema = ScanSchema::new("mv", ScanCategory::Step).bundle(
            vec![ArgType::Device, ArgType::Float],
            1,
            Some(1),
        );
        let req = ScanRequest::new("mv").arg("samx").arg(1.0).arg("samy").arg(2.0);
        assert!(schema.validate(&req).is_err());
    }

    #[test]
    fn repeated_device_is_rejected() {
        let req = ScanRequest::new("line_scan")
            .arg("samx")
            .arg(0.0)
            .arg(4.0)
            .arg("samx")
            .arg(1.0)
            .arg(2.0)
            .kwarg("steps", 5);
        let err = line_scan_schema().validate(&req).unwrap_err();
        assert!(err.to_string().contains("more than once"), "{err}");

        let distinct = ScanRequest::new("line_scan")
            .arg("samx")
            .arg(0.0)
            .arg(4.0)
            .arg("samy")
            .arg(1.0)
            .arg(2.0)
            .kwarg("steps", 5);
        assert!(line_scan_schema().validate(&distinct).is_ok());
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let req: ScanRequest =
            serde_json::from_str(r#"{"scan_type":"acquire","kwargs":{"num_points":3}}"#).unwrap();
        assert_eq!(req.queue, DEFAULT_QUEUE);
        assert!(!req.relative);
        assert_eq!(req.kwarg_u64("num_points", 1), 3);
    }
}
