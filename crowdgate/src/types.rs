use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for a request travelling through the analysis pipeline.
///
/// Uses a short, readable format like "req_abc123xy" instead of full UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string format.
    ///
    /// Takes the first 8 hex characters of the UUID and formats as "req_xxxxxxxx".
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("req_{}", &hex[..8])
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// The upstream services the pipeline talks to.
///
/// Each service gets independent quota counters, circuit state, key pool,
/// and batch window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// AI vision API: base64 image + text prompt, returns a people count.
    Vision,
    /// Maps/places API: coordinates + query, returns area activity data.
    Maps,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Vision => "vision",
            ServiceKind::Maps => "maps",
        }
    }

    /// All services, in a fixed order. Used when building per-service state maps.
    pub fn all() -> [ServiceKind; 2] {
        [ServiceKind::Vision, ServiceKind::Maps]
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier for one credential in a service's key pool, e.g. "vision-0".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(service: ServiceKind, index: usize) -> Self {
        Self(format!("{}-{}", service.as_str(), index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic identifier of a request's semantic content, used as the
/// cache key. Two requests with the same fingerprint are interchangeable.
///
/// 16 hex characters of a blake3 digest over the inputs that determine the
/// answer: image bytes + prompt for vision, rounded coordinates + query kind
/// for maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_image(image: &[u8], prompt: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(image);
        hasher.update(prompt.as_bytes());
        Self::from_hasher(hasher)
    }

    pub fn from_location(lat: f64, lng: f64, query: &str) -> Self {
        // Round to ~11m so nearby callers share a cache slot.
        let mut hasher = blake3::Hasher::new();
        hasher.update(format!("{:.4},{:.4}", lat, lng).as_bytes());
        hasher.update(query.as_bytes());
        Self::from_hasher(hasher)
    }

    fn from_hasher(hasher: blake3::Hasher) -> Self {
        let hex = hasher.finalize().to_hex();
        Self(hex[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which path produced an analysis result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    /// A live upstream API call.
    Api,
    /// Served from a cache tier.
    Cache,
    /// Local non-networked frame heuristic.
    LocalCv,
    /// Statistical or bounded pseudo-random last resort.
    Estimate,
}

impl AnalysisSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisSource::Api => "api",
            AnalysisSource::Cache => "cache",
            AnalysisSource::LocalCv => "local_cv",
            AnalysisSource::Estimate => "estimate",
        }
    }

    /// Trust weight used when combining results from several sources.
    pub fn confidence_weight(&self) -> f64 {
        match self {
            AnalysisSource::Api => 1.0,
            AnalysisSource::Cache => 0.8,
            AnalysisSource::LocalCv => 0.65,
            AnalysisSource::Estimate => 0.4,
        }
    }
}

impl std::fmt::Display for AnalysisSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much a result should be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Confidence {
    pub fn from_weight(weight: f64) -> Self {
        if weight >= 0.9 {
            Confidence::VeryHigh
        } else if weight >= 0.7 {
            Confidence::High
        } else if weight >= 0.5 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    /// Step confidence down `steps` levels, saturating at `Low`.
    pub fn degrade(self, steps: u32) -> Self {
        let mut current = self;
        for _ in 0..steps {
            current = match current {
                Confidence::VeryHigh => Confidence::High,
                Confidence::High => Confidence::Medium,
                Confidence::Medium | Confidence::Low => Confidence::Low,
            };
        }
        current
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
            Confidence::VeryHigh => "very_high",
        }
    }
}

/// Freshness/provenance grade of the data behind a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    Excellent,
    Good,
    Fair,
    Estimated,
}

impl DataQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataQuality::Excellent => "excellent",
            DataQuality::Good => "good",
            DataQuality::Fair => "fair",
            DataQuality::Estimated => "estimated",
        }
    }
}

/// Crowd severity bands derived from the density score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrowdLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl CrowdLevel {
    /// Band thresholds over a 0-100 density score.
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            CrowdLevel::Critical
        } else if score >= 60.0 {
            CrowdLevel::High
        } else if score >= 40.0 {
            CrowdLevel::Medium
        } else if score >= 20.0 {
            CrowdLevel::Low
        } else {
            CrowdLevel::Minimal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrowdLevel::Minimal => "minimal",
            CrowdLevel::Low => "low",
            CrowdLevel::Medium => "medium",
            CrowdLevel::High => "high",
            CrowdLevel::Critical => "critical",
        }
    }
}

/// Scheduling priority for a request inside a batch window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Precomputed luminance statistics for one video frame.
///
/// The actual computer-vision model is an external collaborator; callers that
/// have raw frames attach this summary so the local fallback heuristic can
/// produce an estimate without any network access.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameSummary {
    pub width: u32,
    pub height: u32,
    /// Fraction of pixels darker than the luminance threshold, 0.0-1.0.
    pub dark_pixel_ratio: f64,
    /// Number of person-sized contour regions detected in the frame.
    pub region_count: u32,
}

/// The uniform value returned to every caller, regardless of which path
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub people_count: u32,
    pub crowd_level: CrowdLevel,
    /// 0-100 density score derived from the people count (and, for combined
    /// results, the maps activity factor).
    pub density_score: f64,
    pub confidence_level: Confidence,
    pub source: AnalysisSource,
    pub data_quality: DataQuality,
    /// Human-readable summary of the methods behind this result,
    /// e.g. "ai vision + maps api".
    pub analysis_method: String,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl AnalysisResult {
    /// Build a result from a people count, deriving the density score and
    /// crowd level, with confidence taken from the source's trust weight.
    pub fn from_count(
        people_count: u32,
        source: AnalysisSource,
        data_quality: DataQuality,
        analysis_method: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let density_score = Self::density_score_for(people_count);
        Self {
            people_count,
            crowd_level: CrowdLevel::from_score(density_score),
            density_score,
            confidence_level: Confidence::from_weight(source.confidence_weight()),
            source,
            data_quality,
            analysis_method: analysis_method.into(),
            response_time_ms: 0,
            timestamp,
        }
    }

    /// Density score scaling: three points per person, capped at 100.
    pub fn density_score_for(people_count: u32) -> f64 {
        (f64::from(people_count) * 3.0).min(100.0)
    }

    pub fn with_response_time(mut self, elapsed_ms: u64) -> Self {
        self.response_time_ms = elapsed_ms;
        self
    }
}

/// One analysis request entering the pipeline.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub service: ServiceKind,
    /// Prompt text sent upstream (vision) or query kind (maps).
    pub prompt: String,
    /// Raw image bytes for vision requests; encoded to base64 at the wire.
    pub image: Option<Vec<u8>>,
    pub location: Option<(f64, f64)>,
    /// Frame statistics for the local fallback heuristic, if the caller has them.
    pub frame: Option<FrameSummary>,
    pub priority: Priority,
}

/// Default vision prompt. The upstream is asked for a bare number so the
/// response parser can extract the count without free-text heuristics.
pub const DEFAULT_VISION_PROMPT: &str =
    "Count the number of people visible in this image. Respond with a single number.";

/// Default maps query kind.
pub const DEFAULT_MAPS_QUERY: &str = "area_activity";

impl AnalysisRequest {
    /// A vision analysis request over raw image bytes.
    pub fn vision(image: Vec<u8>) -> Self {
        Self {
            service: ServiceKind::Vision,
            prompt: DEFAULT_VISION_PROMPT.to_string(),
            image: Some(image),
            location: None,
            frame: None,
            priority: Priority::default(),
        }
    }

    /// A maps activity request for a location.
    pub fn maps(lat: f64, lng: f64) -> Self {
        Self {
            service: ServiceKind::Maps,
            prompt: DEFAULT_MAPS_QUERY.to_string(),
            image: None,
            location: Some((lat, lng)),
            frame: None,
            priority: Priority::default(),
        }
    }

    pub fn with_frame(mut self, frame: FrameSummary) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Cache key for this request, derived from its semantic inputs.
    pub fn fingerprint(&self) -> Fingerprint {
        match (self.service, &self.image, self.location) {
            (ServiceKind::Vision, Some(image), _) => {
                Fingerprint::from_image(image, &self.prompt)
            }
            (_, _, Some((lat, lng))) => Fingerprint::from_location(lat, lng, &self.prompt),
            // No image and no location: hash the prompt alone.
            _ => Fingerprint::from_image(&[], &self.prompt),
        }
    }
}
