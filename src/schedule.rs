use chrono::{DateTime, Datelike, SecondsFormat, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Wipe times are interpreted on the US west coast, where the monthly
/// forced wipe lands on the first Thursday.
pub const REFERENCE_TZ: Tz = chrono_tz::America::Los_Angeles;

/// Blueprint wipes happen after this local hour.
pub const BLUEPRINT_MIN_HOUR: u32 = 6;

/// One observed wipe of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WipeEvent {
    pub bm_id: i64,
    pub timestamp: DateTime<Utc>,
}

/// Local weekday (0 = Sunday) and hour of a wipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WipeSlot {
    pub dow: u32,
    pub hour: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipeScheduleInference {
    pub main_hour: Option<u32>,
    pub main_dow: Option<u32>,
    pub last_main: Option<DateTime<Utc>>,
    pub secondary_hour: Option<u32>,
    pub secondary_dow: Option<u32>,
    pub last_secondary: Option<DateTime<Utc>>,
    pub blueprint_hour: Option<u32>,
    pub blueprint_dow: Option<u32>,
    pub last_blueprint: Option<DateTime<Utc>>,
}

impl WipeScheduleInference {
    pub fn is_empty(&self) -> bool {
        self.main_hour.is_none() && self.secondary_hour.is_none() && self.blueprint_hour.is_none()
    }

    fn set_main(&mut self, bucket: &Bucket) {
        self.main_hour = Some(bucket.slot.hour);
        self.main_dow = Some(bucket.slot.dow);
        self.last_main = Some(bucket.latest);
    }

    fn set_secondary(&mut self, bucket: &Bucket) {
        self.secondary_hour = Some(bucket.slot.hour);
        self.secondary_dow = Some(bucket.slot.dow);
        self.last_secondary = Some(bucket.latest);
    }

    fn set_blueprint(&mut self, bucket: &Bucket) {
        self.blueprint_hour = Some(bucket.slot.hour);
        self.blueprint_dow = Some(bucket.slot.dow);
        self.last_blueprint = Some(bucket.latest);
    }
}

/// Next scheduled wipes as advertised by the listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NextWipe {
    /// The wipe that comes first: the full wipe when `is_bp`, else the regular one.
    pub next_wipe: Option<DateTime<Utc>>,
    pub next_wipe_full: Option<DateTime<Utc>>,
    pub is_bp: bool,
    pub hour: Option<u32>,
    pub dow: Option<u32>,
    pub week: Option<u32>,
}

#[derive(Debug)]
struct Bucket {
    slot: WipeSlot,
    count: usize,
    latest: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct WipeScheduleAnalyzer {
    tz: Tz,
    blueprint_min_hour: u32,
}

impl Default for WipeScheduleAnalyzer {
    fn default() -> Self {
        Self::new(REFERENCE_TZ, BLUEPRINT_MIN_HOUR)
    }
}

impl WipeScheduleAnalyzer {
    pub fn new(tz: Tz, blueprint_min_hour: u32) -> Self {
        Self {
            tz,
            blueprint_min_hour,
        }
    }

    pub fn slot(&self, ts: DateTime<Utc>) -> WipeSlot {
        let local = ts.with_timezone(&self.tz);
        WipeSlot {
            dow: local.weekday().num_days_from_sunday(),
            hour: local.hour(),
        }
    }

    /// First-week Thursday after the threshold hour, in local time.
    pub fn is_blueprint(&self, ts: DateTime<Utc>) -> bool {
        let local = ts.with_timezone(&self.tz);
        local.day() <= 7 && local.weekday() == Weekday::Thu && local.hour() > self.blueprint_min_hour
    }

    /// Infer the recurring wipe slots of one server. `history` must already
    /// contain the current observation. Slots are ranked by count; equal
    /// counts keep the order in which the slot first appears in `history`.
    pub fn infer(&self, history: &[WipeEvent]) -> WipeScheduleInference {
        let mut normal: Vec<Bucket> = Vec::new();
        let mut blueprint: Vec<Bucket> = Vec::new();

        for event in history {
            let target = if self.is_blueprint(event.timestamp) {
                &mut blueprint
            } else {
                &mut normal
            };
            self.count_into(target, event.timestamp);
        }

        // stable: ties keep first appearance
        normal.sort_by(|a, b| b.count.cmp(&a.count));
        blueprint.sort_by(|a, b| b.count.cmp(&a.count));

        let mut inference = WipeScheduleInference::default();
        if let Some(main) = normal.first() {
            inference.set_main(main);
        }
        if let Some(secondary) = normal.get(1) {
            inference.set_secondary(secondary);
        }
        if let Some(bp) = blueprint.first() {
            inference.set_blueprint(bp);
        }
        inference
    }

    fn count_into(&self, buckets: &mut Vec<Bucket>, ts: DateTime<Utc>) {
        let slot = self.slot(ts);
        match buckets.iter_mut().find(|b| b.slot == slot) {
            Some(bucket) => {
                bucket.count += 1;
                bucket.latest = bucket.latest.max(ts);
            }
            None => buckets.push(Bucket {
                slot,
                count: 1,
                latest: ts,
            }),
        }
    }

    /// Pick which advertised wipe comes next. The full (blueprint) wipe is
    /// next when it is strictly closer to `now` than the regular one.
    pub fn next_wipe(
        &self,
        regular: Option<DateTime<Utc>>,
        full: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> NextWipe {
        let is_bp = match (regular, full) {
            (Some(r), Some(f)) => (f - now).abs() < (r - now).abs(),
            _ => false,
        };
        let local = regular.map(|r| r.with_timezone(&self.tz));

        NextWipe {
            next_wipe: if is_bp { full } else { regular },
            next_wipe_full: full,
            is_bp,
            hour: local.map(|l| l.hour()),
            dow: local.map(|l| l.weekday().num_days_from_sunday()),
            week: local.map(|l| l.iso_week().week()),
        }
    }
}

/// Parse an API timestamp such as `2024-01-04T20:00:00.000Z`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Render in the listing API's own format (millisecond precision, `Z` suffix).
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
