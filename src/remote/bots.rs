//! Bot counts and bot availability.

use serde::{Deserialize, Deserializer, Serialize};

/// Bot counts for a dimension filter.
///
/// The executor reports counts as JSON strings; plain numbers are accepted
/// too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotsCount {
    #[serde(deserialize_with = "count_from_any")]
    pub count: u64,
    #[serde(default, deserialize_with = "count_from_any")]
    pub busy: u64,
    #[serde(default, deserialize_with = "count_from_any")]
    pub dead: u64,
    #[serde(default, deserialize_with = "count_from_any")]
    pub quarantined: u64,
}

impl BotsCount {
    /// Bots able to take a task right now.
    pub fn idle_count(&self) -> u64 {
        self.count
            .saturating_sub(self.busy)
            .saturating_sub(self.dead)
            .saturating_sub(self.quarantined)
    }
}

fn count_from_any<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Number(u64),
        Text(String),
    }

    match Count::deserialize(deserializer)? {
        Count::Number(n) => Ok(n),
        Count::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// A bot as returned by a bot list query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub bot_id: String,
    #[serde(default)]
    pub is_dead: bool,
    #[serde(default)]
    pub quarantined: bool,
    #[serde(default)]
    pub task_id: Option<String>,
}

impl Bot {
    /// A bot can run tasks unless it is dead or quarantined.
    pub fn is_available(&self) -> bool {
        !(self.is_dead || self.quarantined)
    }
}

/// Filters `bots` down to the available ones.
pub fn available_bots(bots: &[Bot]) -> Vec<&Bot> {
    bots.iter().filter(|b| b.is_available()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_count() {
        let counts = BotsCount {
            count: 10,
            busy: 3,
            dead: 1,
            quarantined: 1,
        };
        assert_eq!(counts.idle_count(), 5);
    }

    #[test]
    fn test_counts_from_strings_and_numbers() {
        let counts: BotsCount = serde_json::from_str(
            r#"{"count": "10", "busy": 3, "dead": "1", "quarantined": "1", "now": "2026-01-01"}"#,
        )
        .unwrap();
        assert_eq!(counts.idle_count(), 5);
    }

    #[test]
    fn test_idle_count_never_negative() {
        let counts = BotsCount {
            count: 1,
            busy: 2,
            dead: 0,
            quarantined: 0,
        };
        assert_eq!(counts.idle_count(), 0);
    }

    #[test]
    fn test_available_bots() {
        let bots: Vec<Bot> = serde_json::from_str(
            r#"[
                {"bot_id": "a", "is_dead": false, "quarantined": false},
                {"bot_id": "b", "is_dead": true, "quarantined": false},
                {"bot_id": "c", "is_dead": false, "quarantined": true},
                {"bot_id": "d"}
            ]"#,
        )
        .unwrap();

        let ids: Vec<_> = available_bots(&bots).iter().map(|b| b.bot_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
    }
}
