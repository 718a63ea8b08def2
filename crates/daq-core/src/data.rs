//! Trace data model.
//!
//! A [`TraceDataset`] is the decoded output of one measurement: ordered `(x, y)`
//! pairs plus units, source template and acquisition time. Y values are
//! [`Sample`]s so that instrument overflow/underflow sentinels survive decoding
//! as typed markers instead of being coerced to numbers.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One decoded value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sample {
    /// Finite value in engineering units
    Value(f64),
    /// Instrument reported the input above range
    Overflow,
    /// Instrument reported the input below range
    Underflow,
}

impl Sample {
    /// The numeric value, if this is not a marker.
    pub fn value(&self) -> Option<f64> {
        match self {
            Sample::Value(v) => Some(*v),
            Sample::Overflow | Sample::Underflow => None,
        }
    }

    /// Whether this sample is an overflow/underflow marker.
    pub fn is_marker(&self) -> bool {
        !matches!(self, Sample::Value(_))
    }

    /// Multiply the value by `factor`; markers are left untouched.
    ///
    /// A product outside the finite range becomes a marker of its sign.
    pub fn scaled(self, factor: f64) -> Self {
        match self {
            Sample::Value(v) => {
                let product = v * factor;
                if product.is_finite() {
                    Sample::Value(product)
                } else if product == f64::NEG_INFINITY {
                    Sample::Underflow
                } else {
                    Sample::Overflow
                }
            }
            marker => marker,
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sample::Value(v) => write!(f, "{v}"),
            Sample::Overflow => f.write_str("overflow"),
            Sample::Underflow => f.write_str("underflow"),
        }
    }
}

/// One `(x, y)` pair of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TracePoint {
    /// X-axis value (frequency bin, time, ...)
    pub x: f64,
    /// Measured value
    pub y: Sample,
}

/// Decoded measurement output.
///
/// Construct with [`TraceDataset::from_axes`], which enforces equal axis lengths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceDataset {
    /// Template (or display) the data came from
    pub source: String,
    /// Analyzer display the trace was read from
    #[serde(default)]
    pub display: u8,
    /// Time the data was downloaded
    pub acquired_at: DateTime<Utc>,
    /// X-axis unit
    pub x_unit: String,
    /// Y-axis unit
    pub y_unit: String,
    /// Ordered trace points
    pub points: Vec<TracePoint>,
}

impl TraceDataset {
    /// Pair up separately retrieved axes.
    ///
    /// # Errors
    /// [`DaqError::Decode`] if the axes differ in length or the x axis carries a
    /// marker (x values are bin positions and must be finite).
    pub fn from_axes(
        source: impl Into<String>,
        x_unit: impl Into<String>,
        y_unit: impl Into<String>,
        x: Vec<Sample>,
        y: Vec<Sample>,
        acquired_at: DateTime<Utc>,
    ) -> AppResult<Self> {
        let source = source.into();

        if x.len() != y.len() {
            return Err(DaqError::Decode {
                command: source,
                reason: format!("x axis has {} points but y axis has {}", x.len(), y.len()),
            });
        }

        let mut points = Vec::with_capacity(x.len());
        for (index, (x, y)) in x.into_iter().zip(y).enumerate() {
            let Some(x) = x.value() else {
                return Err(DaqError::Decode {
                    command: source,
                    reason: format!("x axis point {index} is {x}"),
                });
            };
            points.push(TracePoint { x, y });
        }

        Ok(Self {
            source,
            display: 0,
            acquired_at,
            x_unit: x_unit.into(),
            y_unit: y_unit.into(),
            points,
        })
    }

    /// Tag the dataset with the display it came from.
    pub fn with_display(mut self, display: u8) -> Self {
        self.display = display;
        self
    }

    /// True if both traces sample the same x positions.
    pub fn shares_x_axis(&self, other: &TraceDataset) -> bool {
        self.x_values().eq(other.x_values())
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True if the trace holds no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// X values in order.
    pub fn x_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.x)
    }

    /// Y samples in order.
    pub fn y_samples(&self) -> impl Iterator<Item = Sample> + '_ {
        self.points.iter().map(|p| p.y)
    }

    /// Count of overflow/underflow markers in the y axis.
    pub fn marker_count(&self) -> usize {
        self.points.iter().filter(|p| p.y.is_marker()).count()
    }
}
