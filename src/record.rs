use chrono::{DateTime, Utc};

use crate::classify::ClassifiedAttributes;
use crate::schedule::WipeScheduleInference;

const REGION_MAP: [(&str, &str); 6] = [
    ("US", "North America"),
    ("BO", "South America"),
    ("DE", "Europe"),
    ("CF", "Africa"),
    ("CN", "Asia"),
    ("AU", "Australia"),
];

/// Stored state of one server, keyed by its BattleMetrics id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerRecord {
    pub bm_id: i64,
    pub rank: Option<i64>,
    /// `ip:port`
    pub ip: Option<String>,
    pub title: Option<String>,
    pub region: Option<String>,
    pub players: Option<i64>,
    pub max_players: Option<i64>,
    pub attributes: Option<ClassifiedAttributes>,
    pub schedule: Option<WipeScheduleInference>,
    pub last_wipe: Option<DateTime<Utc>>,
    pub next_wipe: Option<DateTime<Utc>>,
    pub next_wipe_full: Option<DateTime<Utc>>,
    pub next_wipe_is_bp: Option<bool>,
    pub next_wipe_hour: Option<u32>,
    pub next_wipe_dow: Option<u32>,
    pub next_wipe_week: Option<u32>,
}

/// Freshly computed record for the current run, before merging.
pub type CandidateRecord = ServerRecord;

/// Values that count as "nothing new" when merging.
trait Blank {
    fn is_blank(&self) -> bool {
        false
    }
}

impl Blank for String {
    fn is_blank(&self) -> bool {
        matches!(self.trim(), "" | "N/A" | "null")
    }
}

impl Blank for i64 {}
impl Blank for u32 {}
impl Blank for bool {}
impl Blank for DateTime<Utc> {}

impl Blank for ClassifiedAttributes {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

impl Blank for WipeScheduleInference {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

fn coalesce<T: Blank>(fresh: Option<T>, existing: Option<T>) -> Option<T> {
    match fresh {
        Some(v) if !v.is_blank() => Some(v),
        _ => existing,
    }
}

/// Field-by-field merge: fresh values win unless blank. Attributes and
/// schedule are replaced or kept as a whole.
pub fn merge(existing: Option<ServerRecord>, fresh: CandidateRecord) -> ServerRecord {
    let Some(old) = existing else {
        return fresh;
    };

    ServerRecord {
        bm_id: fresh.bm_id,
        rank: coalesce(fresh.rank, old.rank),
        ip: coalesce(fresh.ip, old.ip),
        title: coalesce(fresh.title, old.title),
        region: coalesce(fresh.region, old.region),
        players: coalesce(fresh.players, old.players),
        max_players: coalesce(fresh.max_players, old.max_players),
        attributes: coalesce(fresh.attributes, old.attributes),
        schedule: coalesce(fresh.schedule, old.schedule),
        last_wipe: coalesce(fresh.last_wipe, old.last_wipe),
        next_wipe: coalesce(fresh.next_wipe, old.next_wipe),
        next_wipe_full: coalesce(fresh.next_wipe_full, old.next_wipe_full),
        next_wipe_is_bp: coalesce(fresh.next_wipe_is_bp, old.next_wipe_is_bp),
        next_wipe_hour: coalesce(fresh.next_wipe_hour, old.next_wipe_hour),
        next_wipe_dow: coalesce(fresh.next_wipe_dow, old.next_wipe_dow),
        next_wipe_week: coalesce(fresh.next_wipe_week, old.next_wipe_week),
    }
}

/// Display name for a country filter code; unknown codes pass through.
pub fn region_name(code: &str) -> &str {
    REGION_MAP
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code))
        .map(|(_, name)| *name)
        .unwrap_or(code)
}
