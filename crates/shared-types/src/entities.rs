//! # Event Payloads
//!
//! The closed set of message types that may travel inside an
//! [`EventEnvelope`](crate::envelope::EventEnvelope).
//!
//! ## Clusters
//!
//! - **Fields**: `FieldCreated`, `FieldUpdated`, `FieldDeleted`
//! - **Weather**: `WeatherAlert`
//! - **Crop health**: `CropHealthAnalyzed`
//! - **Tasks**: `TaskCreated`, `TaskCompleted`
//! - **Compliance**: `ComplianceRecorded`
//!
//! Producers own the business meaning of these payloads; this crate only
//! guarantees their shape and value ranges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{require, within, SchemaError};

/// Validation hook implemented by every payload type.
pub trait Validate {
    /// Check value ranges and required fields.
    fn validate(&self) -> Result<(), SchemaError>;
}

// =============================================================================
// SHARED VALUE OBJECTS
// =============================================================================

/// A WGS-84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees, `[-90, 90]`.
    pub latitude: f64,
    /// Longitude in degrees, `[-180, 180]`.
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl Validate for GeoPoint {
    fn validate(&self) -> Result<(), SchemaError> {
        within("latitude", self.latitude, -90.0, 90.0)?;
        within("longitude", self.longitude, -180.0, 180.0)
    }
}

// =============================================================================
// CLUSTER A: FIELDS
// =============================================================================

/// A field was registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCreated {
    pub field_id: String,
    pub farm_id: String,
    pub name: String,
    /// Cultivated area; must be non-negative.
    pub area_hectares: f64,
    pub centroid: GeoPoint,
    #[serde(default)]
    pub crop_type: Option<String>,
}

impl Validate for FieldCreated {
    fn validate(&self) -> Result<(), SchemaError> {
        require("field_id", &self.field_id)?;
        require("farm_id", &self.farm_id)?;
        require("name", &self.name)?;
        within("area_hectares", self.area_hectares, 0.0, f64::MAX)?;
        self.centroid.validate()
    }
}

/// Mutable attributes of a field changed. Absent values were not touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdated {
    pub field_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub area_hectares: Option<f64>,
    #[serde(default)]
    pub crop_type: Option<String>,
}

impl Validate for FieldUpdated {
    fn validate(&self) -> Result<(), SchemaError> {
        require("field_id", &self.field_id)?;
        if let Some(name) = &self.name {
            require("name", name)?;
        }
        if let Some(area) = self.area_hectares {
            within("area_hectares", area, 0.0, f64::MAX)?;
        }
        Ok(())
    }
}

/// A field was removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDeleted {
    pub field_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Validate for FieldDeleted {
    fn validate(&self) -> Result<(), SchemaError> {
        require("field_id", &self.field_id)
    }
}

// =============================================================================
// CLUSTER B: WEATHER
// =============================================================================

/// Kind of weather hazard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherHazard {
    Frost,
    Heat,
    HeavyRain,
    Drought,
    Wind,
    Hail,
}

/// Severity assigned by the weather source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HazardLevel {
    Low,
    Moderate,
    High,
    Extreme,
}

/// A weather hazard is expected at a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherAlert {
    #[serde(default)]
    pub field_id: Option<String>,
    pub location: GeoPoint,
    pub hazard: WeatherHazard,
    pub level: HazardLevel,
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    pub message: String,
}

impl Validate for WeatherAlert {
    fn validate(&self) -> Result<(), SchemaError> {
        self.location.validate()?;
        require("message", &self.message)?;
        if let Some(ends_at) = self.ends_at {
            if ends_at < self.starts_at {
                return Err(SchemaError::InvalidValue {
                    field: "ends_at",
                    reason: "alert window ends before it starts".to_string(),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// CLUSTER C: CROP HEALTH
// =============================================================================

/// A vegetation analysis finished for a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropHealthAnalyzed {
    pub field_id: String,
    /// Normalised difference vegetation index, `[-1, 1]`.
    pub ndvi: f64,
    /// Composite score, `[0, 100]`.
    pub health_score: f64,
    pub analyzed_at: DateTime<Utc>,
    #[serde(default)]
    pub anomalies: Vec<String>,
}

impl Validate for CropHealthAnalyzed {
    fn validate(&self) -> Result<(), SchemaError> {
        require("field_id", &self.field_id)?;
        within("ndvi", self.ndvi, -1.0, 1.0)?;
        within("health_score", self.health_score, 0.0, 100.0)
    }
}

// =============================================================================
// CLUSTER D: TASKS
// =============================================================================

/// Task urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// A field task was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCreated {
    pub task_id: String,
    #[serde(default)]
    pub field_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    pub priority: TaskPriority,
}

impl Validate for TaskCreated {
    fn validate(&self) -> Result<(), SchemaError> {
        require("task_id", &self.task_id)?;
        require("title", &self.title)
    }
}

/// A field task was completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub task_id: String,
    pub completed_by: String,
    pub completed_at: DateTime<Utc>,
}

impl Validate for TaskCompleted {
    fn validate(&self) -> Result<(), SchemaError> {
        require("task_id", &self.task_id)?;
        require("completed_by", &self.completed_by)
    }
}

// =============================================================================
// CLUSTER E: COMPLIANCE
// =============================================================================

/// A compliance record was written for a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRecorded {
    pub record_id: String,
    pub field_id: String,
    pub record_type: String,
    pub recorded_at: DateTime<Utc>,
}

impl Validate for ComplianceRecorded {
    fn validate(&self) -> Result<(), SchemaError> {
        require("record_id", &self.record_id)?;
        require("field_id", &self.field_id)?;
        require("record_type", &self.record_type)
    }
}

// =============================================================================
// CLOSED PAYLOAD SET
// =============================================================================

/// All payloads that may be carried by an envelope.
///
/// Serialized adjacently tagged: `{"event_type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    FieldCreated(FieldCreated),
    FieldUpdated(FieldUpdated),
    FieldDeleted(FieldDeleted),
    WeatherAlert(WeatherAlert),
    CropHealthAnalyzed(CropHealthAnalyzed),
    TaskCreated(TaskCreated),
    TaskCompleted(TaskCompleted),
    ComplianceRecorded(ComplianceRecorded),
}

impl EventPayload {
    /// Discriminant of this payload.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::FieldCreated(_) => EventType::FieldCreated,
            Self::FieldUpdated(_) => EventType::FieldUpdated,
            Self::FieldDeleted(_) => EventType::FieldDeleted,
            Self::WeatherAlert(_) => EventType::WeatherAlert,
            Self::CropHealthAnalyzed(_) => EventType::CropHealthAnalyzed,
            Self::TaskCreated(_) => EventType::TaskCreated,
            Self::TaskCompleted(_) => EventType::TaskCompleted,
            Self::ComplianceRecorded(_) => EventType::ComplianceRecorded,
        }
    }
}

impl Validate for EventPayload {
    fn validate(&self) -> Result<(), SchemaError> {
        match self {
            Self::FieldCreated(p) => p.validate(),
            Self::FieldUpdated(p) => p.validate(),
            Self::FieldDeleted(p) => p.validate(),
            Self::WeatherAlert(p) => p.validate(),
            Self::CropHealthAnalyzed(p) => p.validate(),
            Self::TaskCreated(p) => p.validate(),
            Self::TaskCompleted(p) => p.validate(),
            Self::ComplianceRecorded(p) => p.validate(),
        }
    }
}

/// Fieldless mirror of [`EventPayload`], used by consumers to declare the
/// type they expect on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FieldCreated,
    FieldUpdated,
    FieldDeleted,
    WeatherAlert,
    CropHealthAnalyzed,
    TaskCreated,
    TaskCompleted,
    ComplianceRecorded,
}

impl EventType {
    /// Wire name, identical to the `event_type` tag.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FieldCreated => "field_created",
            Self::FieldUpdated => "field_updated",
            Self::FieldDeleted => "field_deleted",
            Self::WeatherAlert => "weather_alert",
            Self::CropHealthAnalyzed => "crop_health_analyzed",
            Self::TaskCreated => "task_created",
            Self::TaskCompleted => "task_completed",
            Self::ComplianceRecorded => "compliance_recorded",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_created() -> FieldCreated {
        FieldCreated {
            field_id: "field-1".into(),
            farm_id: "farm-1".into(),
            name: "North paddock".into(),
            area_hectares: 12.5,
            centroid: GeoPoint::new(52.1, 5.3),
            crop_type: Some("wheat".into()),
        }
    }

    #[test]
    fn test_geo_point_bounds() {
        assert!(GeoPoint::new(90.0, 180.0).validate().is_ok());
        assert!(GeoPoint::new(-90.0, -180.0).validate().is_ok());
        assert!(matches!(
            GeoPoint::new(91.0, 0.0).validate(),
            Err(SchemaError::OutOfRange { field: "latitude", .. })
        ));
        assert!(matches!(
            GeoPoint::new(0.0, -180.5).validate(),
            Err(SchemaError::OutOfRange { field: "longitude", .. })
        ));
    }

    #[test]
    fn test_field_created_validation() {
        assert!(field_created().validate().is_ok());

        let mut negative_area = field_created();
        negative_area.area_hectares = -1.0;
        assert!(negative_area.validate().is_err());

        let mut blank_farm = field_created();
        blank_farm.farm_id = String::new();
        assert_eq!(
            blank_farm.validate(),
            Err(SchemaError::MissingField { field: "farm_id" })
        );
    }

    #[test]
    fn test_weather_window_ordering() {
        let starts_at = Utc::now();
        let alert = WeatherAlert {
            field_id: None,
            location: GeoPoint::new(10.0, 10.0),
            hazard: WeatherHazard::Frost,
            level: HazardLevel::High,
            starts_at,
            ends_at: Some(starts_at - chrono::Duration::hours(1)),
            message: "Frost expected overnight".into(),
        };
        assert!(matches!(
            alert.validate(),
            Err(SchemaError::InvalidValue { field: "ends_at", .. })
        ));
    }

    #[test]
    fn test_crop_health_ranges() {
        let mut analysis = CropHealthAnalyzed {
            field_id: "field-1".into(),
            ndvi: 0.72,
            health_score: 81.0,
            analyzed_at: Utc::now(),
            anomalies: vec![],
        };
        assert!(analysis.validate().is_ok());

        analysis.ndvi = 1.2;
        assert!(analysis.validate().is_err());

        analysis.ndvi = 0.5;
        analysis.health_score = 100.1;
        assert!(analysis.validate().is_err());
    }

    #[test]
    fn test_payload_tagging() {
        let payload = EventPayload::FieldDeleted(FieldDeleted {
            field_id: "field-9".into(),
            reason: None,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event_type"], "field_deleted");
        assert_eq!(json["data"]["field_id"], "field-9");
        assert_eq!(payload.event_type(), EventType::FieldDeleted);
        assert_eq!(payload.event_type().as_str(), json["event_type"]);
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let json = r#"{"event_type":"harvest_started","data":{}}"#;
        assert!(serde_json::from_str::<EventPayload>(json).is_err());
    }
}
