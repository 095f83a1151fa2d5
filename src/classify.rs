use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static FIRST_INT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Keyword list per label. Matching is case-insensitive substring counting.
const ATTRIBUTE_KEYWORDS: &[(&str, &[&str])] = &[
    ("biweekly", &["biweekly", "bi-weekly", "twice per week"]),
    ("weekly", &["weekly"]),
    ("bimonthly", &["bi-monthly", "bimonthly", "2week", "2 week"]),
    ("monthly", &["monthly"]),
    ("pvp", &["pvp"]),
    ("pve", &["pve"]),
    ("arena", &["arena", "gun game", "deathmatch", "aim train"]),
    ("build", &["build", "creative", "noclip"]),
    ("1x", &["1x"]),
    ("1.5x", &["1.5x"]),
    ("2x", &["2x"]),
    ("3x", &["3x"]),
    ("5x", &["5x"]),
    ("10x", &["10x"]),
    ("100x", &["100x"]),
    ("1000x", &["1000x"]),
    ("solo", &["solo"]),
    ("duo", &["duo"]),
    ("trio", &["trio"]),
    ("quad", &["quad"]),
    (
        "no limit",
        &[
            "5 man",
            "6 man",
            "no group limit",
            "no limit",
            "no max group",
            "clan",
            "big group",
            "large group",
        ],
    ),
];

/// Highest group size first: a server advertising "no limit" and "solo" is treated as no limit.
const GROUP_LIMIT_PRIORITY: [&str; 5] = ["no limit", "quad", "trio", "duo", "solo"];

const GROUP_LIMIT_TRIGGERS: [&str; 3] = ["group limit", "group size", "limit"];

pub const NO_LIMIT: &str = "no limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttributeGroup {
    WipeSchedule,
    GameMode,
    ResourceRate,
    GroupLimit,
}

impl AttributeGroup {
    pub const ALL: [AttributeGroup; 4] = [
        AttributeGroup::WipeSchedule,
        AttributeGroup::GameMode,
        AttributeGroup::ResourceRate,
        AttributeGroup::GroupLimit,
    ];

    /// Column / JSON key used for this group.
    pub fn as_str(self) -> &'static str {
        match self {
            AttributeGroup::WipeSchedule => "wipe_schedule",
            AttributeGroup::GameMode => "game_mode",
            AttributeGroup::ResourceRate => "resource_rate",
            AttributeGroup::GroupLimit => "group_limit",
        }
    }

    pub fn labels(self) -> &'static [&'static str] {
        match self {
            AttributeGroup::WipeSchedule => &["biweekly", "weekly", "bimonthly", "monthly"],
            AttributeGroup::GameMode => &["pvp", "pve", "arena", "build"],
            AttributeGroup::ResourceRate => {
                &["1x", "1.5x", "2x", "3x", "5x", "10x", "100x", "1000x"]
            }
            AttributeGroup::GroupLimit => &["solo", "duo", "trio", "quad", NO_LIMIT],
        }
    }

    /// Label used when no keyword of the group matched.
    fn default_label(self) -> Option<&'static str> {
        match self {
            AttributeGroup::GameMode => Some("pvp"),
            AttributeGroup::ResourceRate => Some("1x"),
            AttributeGroup::WipeSchedule | AttributeGroup::GroupLimit => None,
        }
    }
}

/// Winning label per attribute group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wipe_schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_limit: Option<String>,
}

impl ClassifiedAttributes {
    pub fn get(&self, group: AttributeGroup) -> Option<&str> {
        self.slot(group).as_deref()
    }

    pub fn set(&mut self, group: AttributeGroup, label: Option<&str>) {
        *self.slot_mut(group) = label.map(str::to_string);
    }

    pub fn is_empty(&self) -> bool {
        AttributeGroup::ALL.iter().all(|g| self.get(*g).is_none())
    }

    /// Winning labels in group order, skipping groups without a winner.
    pub fn winners(&self) -> impl Iterator<Item = (AttributeGroup, &str)> {
        AttributeGroup::ALL
            .into_iter()
            .filter_map(move |g| self.get(g).map(|label| (g, label)))
    }

    fn slot(&self, group: AttributeGroup) -> &Option<String> {
        match group {
            AttributeGroup::WipeSchedule => &self.wipe_schedule,
            AttributeGroup::GameMode => &self.game_mode,
            AttributeGroup::ResourceRate => &self.resource_rate,
            AttributeGroup::GroupLimit => &self.group_limit,
        }
    }

    fn slot_mut(&mut self, group: AttributeGroup) -> &mut Option<String> {
        match group {
            AttributeGroup::WipeSchedule => &mut self.wipe_schedule,
            AttributeGroup::GameMode => &mut self.game_mode,
            AttributeGroup::ResourceRate => &mut self.resource_rate,
            AttributeGroup::GroupLimit => &mut self.group_limit,
        }
    }
}

/// Classify a server from its title and description. Never fails: missing
/// text should be passed as "".
pub fn classify(title: &str, description: &str) -> ClassifiedAttributes {
    let title = title.to_lowercase();
    let description = description.to_lowercase();

    let mut attrs = ClassifiedAttributes::default();
    for group in AttributeGroup::ALL {
        let counts = label_counts(group, &title, &description);
        let winner = match group {
            AttributeGroup::GroupLimit => Some(
                pick_by_priority(&counts).unwrap_or_else(|| group_limit_from_lines(&description)),
            ),
            _ => pick_highest(&counts).or(group.default_label()),
        };
        attrs.set(group, winner);
    }
    attrs
}

/// Keyword hit count per label of `group`, in label order. Inputs must already be lowercase.
fn label_counts(group: AttributeGroup, title: &str, description: &str) -> Vec<(&'static str, usize)> {
    group
        .labels()
        .iter()
        .map(|label| {
            let keywords = keywords_for(label);
            let count = count_keywords(keywords, title) + count_keywords(keywords, description);
            (*label, count)
        })
        .collect()
}

fn keywords_for(label: &str) -> &'static [&'static str] {
    ATTRIBUTE_KEYWORDS
        .iter()
        .find(|(l, _)| *l == label)
        .map(|(_, kws)| *kws)
        .unwrap_or(&[])
}

fn count_keywords(keywords: &[&str], text: &str) -> usize {
    keywords.iter().map(|kw| text.matches(kw).count()).sum()
}

/// Strictly highest count wins; on ties the earlier label is kept.
fn pick_highest(counts: &[(&'static str, usize)]) -> Option<&'static str> {
    let mut best: Option<(&'static str, usize)> = None;
    for &(label, count) in counts {
        if count == 0 {
            continue;
        }
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((label, count));
        }
    }
    best.map(|(label, _)| label)
}

fn pick_by_priority(counts: &[(&'static str, usize)]) -> Option<&'static str> {
    GROUP_LIMIT_PRIORITY.into_iter().find(|wanted| {
        counts
            .iter()
            .any(|(label, count)| label == wanted && *count > 0)
    })
}

/// Look for lines like "group limit: 3" in the description. Every trigger
/// line is visited; the last one whose first integer is 1-4 decides.
fn group_limit_from_lines(description: &str) -> &'static str {
    description
        .lines()
        .filter(|line| GROUP_LIMIT_TRIGGERS.iter().any(|t| line.contains(t)))
        .filter_map(|line| FIRST_INT_RE.find(line))
        .fold(NO_LIMIT, |current, m| match m.as_str() {
            "1" => "solo",
            "2" => "duo",
            "3" => "trio",
            "4" => "quad",
            _ => current,
        })
}
