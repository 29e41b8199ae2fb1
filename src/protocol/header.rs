//! Typed header mapping.
//!
//! A header type declares its fields once, as a `static` table of [`FieldSpec`]s, and
//! converts itself to and from a [`FieldValues`] bag. The table is the registry: it is built
//! at compile time, shared by every command, and never recomputed per call. The functions in
//! this module move values between that bag and a command's string `ext_fields`, checking
//! each value against the declared [`FieldKind`].
//!
//! # Example
//! ```rust
//! use remoting::protocol::{
//!     CustomHeader, FieldKind, FieldSpec, FieldValues, RemotingCommand,
//! };
//!
//! #[derive(Debug, PartialEq)]
//! struct PullHeader {
//!     topic: String,
//!     queue_id: i32,
//!     sub_expression: Option<String>,
//! }
//!
//! impl CustomHeader for PullHeader {
//!     const FIELDS: &'static [FieldSpec] = &[
//!         FieldSpec::required("topic", FieldKind::String),
//!         FieldSpec::required("queueId", FieldKind::Int),
//!         FieldSpec::optional("subExpression", FieldKind::String),
//!     ];
//!
//!     fn to_values(&self) -> FieldValues {
//!         FieldValues::new()
//!             .with("topic", self.topic.as_str())
//!             .with("queueId", self.queue_id)
//!             .with_opt("subExpression", self.sub_expression.as_deref())
//!     }
//!
//!     fn from_values(values: &mut FieldValues) -> remoting::Result<Self> {
//!         Ok(Self {
//!             topic: values.string("topic")?,
//!             queue_id: values.int("queueId")?,
//!             sub_expression: values.opt_string("subExpression")?,
//!         })
//!     }
//! }
//!
//! let header = PullHeader { topic: "orders".into(), queue_id: 3, sub_expression: None };
//! let request = RemotingCommand::create_request_with_header(11, &header).unwrap();
//! assert_eq!(request.ext_field("queueId"), Some("3"));
//! assert_eq!(request.read_custom_header::<PullHeader>().unwrap(), header);
//! ```
use std::{collections::HashMap, fmt, str::FromStr};

use log::trace;

use crate::{RemotingError, error::Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Int,
    Long,
    Bool,
    Double,
    Boundary,
}

/// Which end of a range a query addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundaryType {
    Lower,
    Upper,
}

impl fmt::Display for BoundaryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundaryType::Lower => write!(f, "lower"),
            BoundaryType::Upper => write!(f, "upper"),
        }
    }
}

impl FromStr for BoundaryType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("lower") {
            Ok(BoundaryType::Lower)
        } else if s.eq_ignore_ascii_case("upper") {
            Ok(BoundaryType::Upper)
        } else {
            Err(())
        }
    }
}

/// One row of a header's field table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub optional: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            optional: false,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            optional: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Int(i32),
    Long(i64),
    Bool(bool),
    Double(f64),
    Boundary(BoundaryType),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::String(_) => FieldKind::String,
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Long(_) => FieldKind::Long,
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Double(_) => FieldKind::Double,
            FieldValue::Boundary(_) => FieldKind::Boundary,
        }
    }

    fn parse(spec: &FieldSpec, raw: &str) -> Result<Self> {
        let invalid = || RemotingError::InvalidFieldValue {
            field: spec.name,
            value: raw.to_string(),
        };

        let value = match spec.kind {
            FieldKind::String => FieldValue::String(raw.to_string()),
            FieldKind::Int => FieldValue::Int(raw.trim().parse().map_err(|_| invalid())?),
            FieldKind::Long => FieldValue::Long(raw.trim().parse().map_err(|_| invalid())?),
            FieldKind::Bool => FieldValue::Bool(raw.trim().parse().map_err(|_| invalid())?),
            FieldKind::Double => FieldValue::Double(raw.trim().parse().map_err(|_| invalid())?),
            FieldKind::Boundary => {
                FieldValue::Boundary(raw.trim().parse().map_err(|_| invalid())?)
            }
        };
        Ok(value)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::String(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Long(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Double(v) => write!(f, "{v}"),
            FieldValue::Boundary(v) => write!(f, "{v}"),
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Long(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl From<BoundaryType> for FieldValue {
    fn from(value: BoundaryType) -> Self {
        FieldValue::Boundary(value)
    }
}

/// Values of one header keyed by field name, on their way to or from `ext_fields`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FieldValues {
    values: HashMap<&'static str, FieldValue>,
}

macro_rules! typed_getters {
    ($($get:ident, $opt:ident, $variant:ident => $ty:ty;)*) => {
        $(
            pub fn $get(&mut self, name: &'static str) -> Result<$ty> {
                self.$opt(name)?
                    .ok_or(RemotingError::MissingRequiredField(name))
            }

            pub fn $opt(&mut self, name: &'static str) -> Result<Option<$ty>> {
                match self.values.remove(name) {
                    Some(FieldValue::$variant(v)) => Ok(Some(v)),
                    Some(_) => Err(RemotingError::UnsupportedFieldType { field: name }),
                    None => Ok(None),
                }
            }
        )*
    };
}

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: impl Into<FieldValue>) -> Self {
        self.values.insert(name, value.into());
        self
    }

    pub fn with_opt<V: Into<FieldValue>>(self, name: &'static str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.with(name, value),
            None => self,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    typed_getters! {
        string, opt_string, String => String;
        int, opt_int, Int => i32;
        long, opt_long, Long => i64;
        boolean, opt_boolean, Bool => bool;
        double, opt_double, Double => f64;
        boundary, opt_boundary, Boundary => BoundaryType;
    }
}

/// A header type whose fields travel in a command's `ext_fields`.
pub trait CustomHeader: Sized {
    /// Field table for this header type.
    const FIELDS: &'static [FieldSpec];

    fn to_values(&self) -> FieldValues;

    fn from_values(values: &mut FieldValues) -> Result<Self>;

    /// Semantic validation run after decoding and before encoding.
    fn check_fields(&self) -> Result<()> {
        Ok(())
    }
}

/// Flatten `header` into `ext_fields`. Every field the table marks required must be present
/// and every value must match its declared kind.
pub(crate) fn write_fields<H: CustomHeader>(
    header: &H,
    ext_fields: &mut HashMap<String, String>,
) -> Result<()> {
    header.check_fields()?;
    let mut values = header.to_values();

    for spec in H::FIELDS {
        match values.values.remove(spec.name) {
            Some(value) if value.kind() != spec.kind => {
                return Err(RemotingError::UnsupportedFieldType { field: spec.name });
            }
            Some(value) => {
                ext_fields.insert(spec.name.to_string(), value.to_string());
            }
            None if spec.optional => {}
            None => return Err(RemotingError::MissingRequiredField(spec.name)),
        }
    }

    if let Some(name) = values.values.keys().next() {
        return Err(RemotingError::UnsupportedFieldType { field: *name });
    }
    Ok(())
}

/// Rebuild `H` from `ext_fields`. Keys the table does not declare are ignored.
pub(crate) fn read_fields<H: CustomHeader>(ext_fields: &HashMap<String, String>) -> Result<H> {
    let mut values = FieldValues::new();

    for spec in H::FIELDS {
        match ext_fields.get(spec.name) {
            Some(raw) => {
                values.values.insert(spec.name, FieldValue::parse(spec, raw)?);
            }
            None if spec.optional => trace!("optional header field '{}' absent", spec.name),
            None => return Err(RemotingError::MissingRequiredField(spec.name)),
        }
    }

    let header = H::from_values(&mut values)?;
    header.check_fields()?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct QueryOffsetHeader {
        topic: String,
        queue_id: i32,
        timestamp: i64,
        commit: bool,
        ratio: f64,
        boundary: BoundaryType,
        consumer_group: Option<String>,
    }

    impl CustomHeader for QueryOffsetHeader {
        const FIELDS: &'static [FieldSpec] = &[
            FieldSpec::required("topic", FieldKind::String),
            FieldSpec::required("queueId", FieldKind::Int),
            FieldSpec::required("timestamp", FieldKind::Long),
            FieldSpec::required("commit", FieldKind::Bool),
            FieldSpec::required("ratio", FieldKind::Double),
            FieldSpec::required("boundaryType", FieldKind::Boundary),
            FieldSpec::optional("consumerGroup", FieldKind::String),
        ];

        fn to_values(&self) -> FieldValues {
            FieldValues::new()
                .with("topic", self.topic.as_str())
                .with("queueId", self.queue_id)
                .with("timestamp", self.timestamp)
                .with("commit", self.commit)
                .with("ratio", self.ratio)
                .with("boundaryType", self.boundary)
                .with_opt("consumerGroup", self.consumer_group.as_deref())
        }

        fn from_values(values: &mut FieldValues) -> Result<Self> {
            Ok(Self {
                topic: values.string("topic")?,
                queue_id: values.int("queueId")?,
                timestamp: values.long("timestamp")?,
                commit: values.boolean("commit")?,
                ratio: values.double("ratio")?,
                boundary: values.boundary("boundaryType")?,
                consumer_group: values.opt_string("consumerGroup")?,
            })
        }

        fn check_fields(&self) -> Result<()> {
            if self.queue_id < 0 {
                return Err(RemotingError::InvalidFieldValue {
                    field: "queueId",
                    value: self.queue_id.to_string(),
                });
            }
            Ok(())
        }
    }

    fn sample() -> QueryOffsetHeader {
        QueryOffsetHeader {
            topic: "TopicTest".into(),
            queue_id: 2,
            timestamp: 1_700_000_000_123,
            commit: true,
            ratio: 0.1 + 0.2,
            boundary: BoundaryType::Upper,
            consumer_group: Some("cg".into()),
        }
    }

    #[test]
    fn every_kind_survives_ext_fields() {
        let mut ext = HashMap::new();
        write_fields(&sample(), &mut ext).unwrap();

        assert_eq!(ext["queueId"], "2");
        assert_eq!(ext["boundaryType"], "upper");
        assert_eq!(ext["commit"], "true");

        let decoded: QueryOffsetHeader = read_fields(&ext).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn optional_field_may_be_absent() {
        let header = QueryOffsetHeader {
            consumer_group: None,
            ..sample()
        };
        let mut ext = HashMap::new();
        write_fields(&header, &mut ext).unwrap();
        assert!(!ext.contains_key("consumerGroup"));

        let decoded: QueryOffsetHeader = read_fields(&ext).unwrap();
        assert_eq!(decoded.consumer_group, None);
    }

    #[test]
    fn missing_required_field() {
        let mut ext = HashMap::new();
        write_fields(&sample(), &mut ext).unwrap();
        ext.remove("timestamp");

        let err = read_fields::<QueryOffsetHeader>(&ext).unwrap_err();
        assert!(matches!(err, RemotingError::MissingRequiredField("timestamp")));
    }

    #[test]
    fn unparsable_value() {
        let mut ext = HashMap::new();
        write_fields(&sample(), &mut ext).unwrap();
        ext.insert("queueId".into(), "three".into());

        let err = read_fields::<QueryOffsetHeader>(&ext).unwrap_err();
        assert!(matches!(
            err,
            RemotingError::InvalidFieldValue { field: "queueId", .. }
        ));
    }

    #[test]
    fn check_fields_runs_on_encode() {
        let header = QueryOffsetHeader {
            queue_id: -1,
            ..sample()
        };
        let mut ext = HashMap::new();
        assert!(write_fields(&header, &mut ext).is_err());
        assert!(ext.is_empty());
    }

    struct MistypedHeader;

    impl CustomHeader for MistypedHeader {
        const FIELDS: &'static [FieldSpec] = &[FieldSpec::required("offset", FieldKind::Long)];

        fn to_values(&self) -> FieldValues {
            FieldValues::new().with("offset", 10_i32)
        }

        fn from_values(values: &mut FieldValues) -> Result<Self> {
            values.long("offset").map(|_| MistypedHeader)
        }
    }

    #[test]
    fn kind_mismatch_is_unsupported() {
        let mut ext = HashMap::new();
        let err = write_fields(&MistypedHeader, &mut ext).unwrap_err();
        assert!(matches!(
            err,
            RemotingError::UnsupportedFieldType { field: "offset" }
        ));
    }

    #[test]
    fn boundary_parse_is_case_insensitive() {
        assert_eq!("LOWER".parse::<BoundaryType>(), Ok(BoundaryType::Lower));
        assert_eq!("upper".parse::<BoundaryType>(), Ok(BoundaryType::Upper));
        assert!("middle".parse::<BoundaryType>().is_err());
    }
}
