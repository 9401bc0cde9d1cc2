use chrono::{DateTime, Utc};

/// Prefix shared by every in-band metadata marker line.
const MARKER_PREFIX: &str = "::itm_";

/// Separator between the kind token and the optional payload.
const MARKER_SEPARATOR: &str = "::";

/// The kinds of metadata a legacy message body can carry in-band.
///
/// The legacy backing store had no columns for edit/receipt metadata, so it
/// was smuggled into the message text as `::itm_<kind>::<payload?>` lines.
/// Structured columns are the primary representation now; this codec exists
/// so rows written by the old portals still decode correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Edited,
    DeliveredBuyer,
    DeliveredVendor,
    ReadBuyer,
    ReadVendor,
}

impl MarkerKind {
    /// Parse a kind token, case-insensitively.
    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "edited" => Some(Self::Edited),
            "delivered_buyer" => Some(Self::DeliveredBuyer),
            "delivered_vendor" => Some(Self::DeliveredVendor),
            "read_buyer" => Some(Self::ReadBuyer),
            "read_vendor" => Some(Self::ReadVendor),
            _ => None,
        }
    }

    /// The canonical lowercase token for this kind.
    fn token(self) -> &'static str {
        match self {
            Self::Edited => "edited",
            Self::DeliveredBuyer => "delivered_buyer",
            Self::DeliveredVendor => "delivered_vendor",
            Self::ReadBuyer => "read_buyer",
            Self::ReadVendor => "read_vendor",
        }
    }
}

/// One parsed marker line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub kind: MarkerKind,
    /// Embedded timestamp, if the payload carried one. Legacy writers did
    /// not always record it, so a marker can convey the bare fact alone.
    pub at: Option<DateTime<Utc>>,
}

/// Metadata extracted from a message body.
///
/// Duplicate markers of the same kind: the last occurrence in the body wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyMeta {
    pub edited: bool,
    pub delivered_buyer: Option<Marker>,
    pub delivered_vendor: Option<Marker>,
    pub read_buyer: Option<Marker>,
    pub read_vendor: Option<Marker>,
}

impl BodyMeta {
    fn record(&mut self, marker: Marker) {
        match marker.kind {
            MarkerKind::Edited => self.edited = true,
            MarkerKind::DeliveredBuyer => self.delivered_buyer = Some(marker),
            MarkerKind::DeliveredVendor => self.delivered_vendor = Some(marker),
            MarkerKind::ReadBuyer => self.read_buyer = Some(marker),
            MarkerKind::ReadVendor => self.read_vendor = Some(marker),
        }
    }
}

/// A message body split into its visible text and extracted metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBody {
    /// All non-marker lines, verbatim and in original relative order,
    /// with trailing whitespace trimmed once at the end.
    pub visible_text: String,
    pub meta: BodyMeta,
}

/// Try to parse a single line as a marker.
///
/// Fail-open: anything that is not exactly `::itm_<known-kind>::<payload?>`
/// returns `None` and stays visible text. An unparseable payload timestamp
/// does not invalidate the marker, only its `at`.
fn parse_marker_line(line: &str) -> Option<Marker> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let rest = line.strip_prefix(MARKER_PREFIX)?;
    let sep = rest.find(MARKER_SEPARATOR)?;
    let kind = MarkerKind::from_token(&rest[..sep])?;
    let payload = &rest[sep + MARKER_SEPARATOR.len()..];
    let at = if payload.is_empty() {
        None
    } else {
        DateTime::parse_from_rfc3339(payload)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    };
    Some(Marker { kind, at })
}

/// Scan a stored message body, extracting marker lines into [`BodyMeta`].
pub fn decode(raw: &str) -> DecodedBody {
    let mut meta = BodyMeta::default();
    let mut visible: Vec<&str> = Vec::new();

    for line in raw.split('\n') {
        if let Some(marker) = parse_marker_line(line) {
            meta.record(marker);
        } else {
            visible.push(line);
        }
    }

    DecodedBody {
        visible_text: visible.join("\n").trim_end().to_string(),
        meta,
    }
}

/// Append a canonical marker line to a body.
///
/// Legacy-compatibility write path only: acknowledgments destined for rows
/// imported from the old portals are expressed as markers so both readings
/// of the row agree. New rows carry structured columns instead.
pub fn append_marker(body: &str, kind: MarkerKind, at: Option<DateTime<Utc>>) -> String {
    let payload = at.map(|dt| dt.to_rfc3339()).unwrap_or_default();
    format!("{body}\n{MARKER_PREFIX}{}{MARKER_SEPARATOR}{payload}", kind.token())
}
