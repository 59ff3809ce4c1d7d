//! Core domain models and strongly-typed identifiers.
//!
//! Defines transmissions, delivery endpoints, audit log entries and newtype
//! ID wrappers for compile-time type safety. Enums are stored as text columns
//! and carry their own sqlx encode/decode implementations.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use uuid::Uuid;

use crate::tasks::EventKind;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Baud rate assumed when the gateway does not report one.
pub const DEFAULT_BAUD_RATE: i32 = 14_400;

/// Strongly-typed transmission identifier.
///
/// Assigned once at creation and never changed. This is the `uuid` field of
/// every webhook payload and the key for per-transmission serialization.
///
/// # Example
///
/// ```
/// use faxline_core::models::TransmissionId;
/// let id = TransmissionId::new();
/// let parsed: TransmissionId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransmissionId(pub Uuid);

impl TransmissionId {
    /// Creates a new random transmission ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TransmissionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for TransmissionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl sqlx::Type<PgDb> for TransmissionId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TransmissionId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        <Uuid as sqlx::Decode<PgDb>>::decode(value).map(Self)
    }
}

impl sqlx::Encode<'_, PgDb> for TransmissionId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed webhook endpoint identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub Uuid);

impl EndpointId {
    /// Creates a new random endpoint ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EndpointId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EndpointId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EndpointId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        <Uuid as sqlx::Decode<PgDb>>::decode(value).map(Self)
    }
}

impl sqlx::Encode<'_, PgDb> for EndpointId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Which way the document travels relative to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// We place the call and send the document.
    Outbound,
    /// The remote party called us.
    Inbound,
}

impl Direction {
    /// Database and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for Direction {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Direction {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "outbound" => Ok(Self::Outbound),
            "inbound" => Ok(Self::Inbound),
            _ => Err(format!("invalid direction: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for Direction {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Lifecycle state of a transmission.
///
/// ```text
/// queued → dialing → negotiating → transmitting → completed
///    ▲                                          ├→ failed    ┐
///    │                                          ├→ busy      ├─ retry reset
///    │                                          ├→ no_answer ┘
///    └──────────────────────────────────────────┘
/// any non-terminal state ──cancel──▶ cancelled
/// ```
///
/// `completed` and `cancelled` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionStatus {
    /// Waiting to be dialed.
    Queued,
    /// Call placed, waiting for the remote side.
    Dialing,
    /// Remote answered, fax handshake in progress.
    Negotiating,
    /// Pages are being transferred.
    Transmitting,
    /// Document delivered.
    Completed,
    /// Generic failure.
    Failed,
    /// Remote line busy.
    Busy,
    /// Remote did not answer.
    NoAnswer,
    /// Cancelled before completion.
    Cancelled,
}

impl TransmissionStatus {
    /// Every status, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::Queued,
        Self::Dialing,
        Self::Negotiating,
        Self::Transmitting,
        Self::Completed,
        Self::Failed,
        Self::Busy,
        Self::NoAnswer,
        Self::Cancelled,
    ];

    /// Database and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dialing => "dialing",
            Self::Negotiating => "negotiating",
            Self::Transmitting => "transmitting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Busy => "busy",
            Self::NoAnswer => "no_answer",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states need an explicit retry reset to move again.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Busy | Self::NoAnswer | Self::Cancelled
        )
    }

    /// Failure states that a retry may reset back to `queued`.
    pub const fn is_recoverable_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Busy | Self::NoAnswer)
    }

    /// Position in the forward progression, `None` for terminal states.
    pub const fn progress_index(self) -> Option<u8> {
        match self {
            Self::Queued => Some(0),
            Self::Dialing => Some(1),
            Self::Negotiating => Some(2),
            Self::Transmitting => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for TransmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid transmission status: {s}"))
    }
}

impl sqlx::Type<PgDb> for TransmissionStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TransmissionStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for TransmissionStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Reference to a stored document plus the metadata the core needs from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArtifactRef {
    /// Opaque document store reference (path or object key).
    #[sqlx(rename = "artifact_ref")]
    pub reference: String,

    /// Size of the stored artifact in bytes.
    #[sqlx(rename = "artifact_size")]
    pub size_bytes: i64,

    /// Lowercase hex SHA-256 of the artifact content.
    #[sqlx(rename = "artifact_sha256")]
    pub sha256: String,
}

impl ArtifactRef {
    /// Builds a reference from already-known metadata.
    pub fn new(reference: impl Into<String>, size_bytes: i64, sha256: impl Into<String>) -> Self {
        Self { reference: reference.into(), size_bytes, sha256: sha256.into() }
    }

    /// Computes size and content hash for the given artifact bytes.
    pub fn from_bytes(reference: impl Into<String>, content: &[u8]) -> Self {
        let size_bytes = i64::try_from(content.len()).unwrap_or(i64::MAX);
        let sha256 = hex::encode(Sha256::digest(content));
        Self { reference: reference.into(), size_bytes, sha256 }
    }
}

/// One document transmission and its retries.
///
/// Mutated only by the lifecycle manager. Invariants that hold after every
/// transition are checked by [`Transmission::check_invariants`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transmission {
    /// Unique identifier, immutable.
    pub id: TransmissionId,

    /// Outbound or inbound.
    pub direction: Direction,

    /// Current lifecycle state.
    pub status: TransmissionStatus,

    /// Sender number or station identifier.
    pub sender: String,

    /// Recipient number; drives the cost multiplier for outbound faxes.
    pub recipient: String,

    /// Stored document.
    #[sqlx(flatten)]
    pub artifact: ArtifactRef,

    /// Pages transferred, as reported by the gateway.
    pub pages: i32,

    /// Call duration in seconds.
    pub duration_seconds: i32,

    /// Negotiated transfer rate.
    pub baud_rate: i32,

    /// Whether error correction mode was used.
    pub ecm_used: bool,

    /// Gateway call identifier of the current attempt.
    pub call_ref: Option<String>,

    /// When the transmission was submitted.
    pub queued_at: DateTime<Utc>,

    /// When the current attempt started dialing.
    pub started_at: Option<DateTime<Utc>>,

    /// Set if and only if the status is terminal.
    pub completed_at: Option<DateTime<Utc>>,

    /// Gateway error code of the last failed attempt.
    pub error_code: Option<String>,

    /// Gateway error text of the last failed attempt.
    pub error_message: Option<String>,

    /// Retries already granted.
    pub retry_count: i32,

    /// Maximum retries allowed.
    pub retry_limit: i32,

    /// Billed amount, non-zero only for completed outbound transmissions.
    pub cost: Decimal,

    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Transmission {
    /// Creates a transmission in `queued`.
    pub fn new(
        direction: Direction,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        artifact: ArtifactRef,
        retry_limit: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransmissionId::new(),
            direction,
            status: TransmissionStatus::Queued,
            sender: sender.into(),
            recipient: recipient.into(),
            artifact,
            pages: 0,
            duration_seconds: 0,
            baud_rate: DEFAULT_BAUD_RATE,
            ecm_used: false,
            call_ref: None,
            queued_at: now,
            started_at: None,
            completed_at: None,
            error_code: None,
            error_message: None,
            retry_count: 0,
            retry_limit: retry_limit.max(0),
            cost: Decimal::ZERO,
            updated_at: now,
        }
    }

    /// Shorthand for `self.status.is_terminal()`.
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Verifies the record-level invariants.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.is_terminal() != self.completed_at.is_some() {
            return Err(format!(
                "completed_at is {} while status is {}",
                if self.completed_at.is_some() { "set" } else { "unset" },
                self.status
            ));
        }
        if self.retry_count < 0 || self.retry_count > self.retry_limit {
            return Err(format!(
                "retry_count {} outside 0..={}",
                self.retry_count, self.retry_limit
            ));
        }
        if !self.cost.is_zero()
            && !(self.status == TransmissionStatus::Completed
                && self.direction == Direction::Outbound)
        {
            return Err(format!(
                "cost {} on a {} {} transmission",
                self.cost, self.direction, self.status
            ));
        }
        Ok(())
    }
}

/// Severity of an audit log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    /// Normal lifecycle progress.
    Info,
    /// Something went wrong outside the transmission itself.
    Warning,
    /// The transmission attempt failed.
    Error,
}

impl AuditLevel {
    /// Database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for AuditLevel {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AuditLevel {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid audit level: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for AuditLevel {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Append-only record attached to a transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogEntry {
    /// Unique identifier for this entry.
    pub id: Uuid,

    /// Transmission this entry belongs to.
    pub transmission_id: TransmissionId,

    /// When the entry was written.
    pub recorded_at: DateTime<Utc>,

    /// Severity.
    pub level: AuditLevel,

    /// Human-readable summary.
    pub message: String,

    /// Structured detail map.
    pub details: Option<Json<serde_json::Value>>,
}

impl AuditLogEntry {
    /// Creates an entry without details.
    pub fn new(
        transmission_id: TransmissionId,
        level: AuditLevel,
        message: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transmission_id,
            recorded_at,
            level,
            message: message.into(),
            details: None,
        }
    }

    /// Creates an `info` entry.
    pub fn info(
        transmission_id: TransmissionId,
        message: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self::new(transmission_id, AuditLevel::Info, message, recorded_at)
    }

    /// Creates a `warning` entry.
    pub fn warning(
        transmission_id: TransmissionId,
        message: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self::new(transmission_id, AuditLevel::Warning, message, recorded_at)
    }

    /// Creates an `error` entry.
    pub fn error(
        transmission_id: TransmissionId,
        message: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self::new(transmission_id, AuditLevel::Error, message, recorded_at)
    }

    /// Attaches a structured detail map.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(Json(details));
        self
    }

    /// Returns a detail field, if present.
    pub fn detail(&self, key: &str) -> Option<&serde_json::Value> {
        self.details.as_ref().and_then(|Json(details)| details.get(key))
    }
}

/// A registered webhook receiver.
///
/// Registration is managed elsewhere; the delivery path only updates the
/// health columns (`consecutive_failures`, `last_success_at`,
/// `last_failure_at`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryEndpoint {
    /// Unique identifier.
    pub id: EndpointId,

    /// Destination URL receiving the POST.
    pub url: String,

    /// HMAC key shared with the receiver.
    pub secret: String,

    /// Subscribed to `fax.received`.
    pub on_received: bool,

    /// Subscribed to `fax.sent`.
    pub on_sent: bool,

    /// Subscribed to `fax.failed`.
    pub on_failed: bool,

    /// Inactive endpoints receive nothing.
    pub is_active: bool,

    /// Failed deliveries since the last success. Advisory.
    pub consecutive_failures: i32,

    /// Time of the last successful delivery.
    pub last_success_at: Option<DateTime<Utc>>,

    /// Time of the last failed delivery.
    pub last_failure_at: Option<DateTime<Utc>>,

    /// Registration time.
    pub created_at: DateTime<Utc>,
}

impl DeliveryEndpoint {
    /// Creates an active endpoint subscribed to every event kind.
    pub fn new(url: impl Into<String>, secret: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: EndpointId::new(),
            url: url.into(),
            secret: secret.into(),
            on_received: true,
            on_sent: true,
            on_failed: true,
            is_active: true,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            created_at: now,
        }
    }

    /// Whether this endpoint wants events of the given kind.
    pub const fn subscribes_to(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Received => self.on_received,
            EventKind::Sent => self.on_sent,
            EventKind::Failed => self.on_failed,
        }
    }
}
