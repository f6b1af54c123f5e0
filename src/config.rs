use crate::db;
use crate::transition::Grade;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const CAPACITY_KEY: &str = "setup.capacity";
pub const GRADES_KEY: &str = "setup.grades";
pub const CURRENT_YEAR_KEY: &str = "academic.currentYear";

/// Section letters; also bounds `max_parallel_sections`.
pub const SECTION_LETTERS: [char; 26] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R',
    'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityThresholds {
    pub minimum: usize,
    pub comfortable: usize,
    pub optimal: usize,
    pub high: usize,
    pub maximum: usize,
    pub max_parallel_sections: usize,
}

impl Default for CapacityThresholds {
    fn default() -> Self {
        Self {
            minimum: 20,
            comfortable: 30,
            optimal: 35,
            high: 40,
            maximum: 45,
            max_parallel_sections: 12,
        }
    }
}

impl CapacityThresholds {
    pub fn validate(&self) -> Result<(), String> {
        if self.minimum < 1 {
            return Err("minimum must be >= 1".into());
        }
        let ordered = [
            ("minimum", self.minimum),
            ("comfortable", self.comfortable),
            ("optimal", self.optimal),
            ("high", self.high),
            ("maximum", self.maximum),
        ];
        for pair in ordered.windows(2) {
            if pair[0].1 > pair[1].1 {
                return Err(format!("{} must be <= {}", pair[0].0, pair[1].0));
            }
        }
        if !(1..=SECTION_LETTERS.len()).contains(&self.max_parallel_sections) {
            return Err(format!(
                "maxParallelSections must be in 1..={}",
                SECTION_LETTERS.len()
            ));
        }
        Ok(())
    }

    fn to_value(self) -> Value {
        json!({
            "minimum": self.minimum,
            "comfortable": self.comfortable,
            "optimal": self.optimal,
            "high": self.high,
            "maximum": self.maximum,
            "maxParallelSections": self.max_parallel_sections
        })
    }

    /// Applies a camelCase patch. The result is validated as a whole so a
    /// patch may move several thresholds at once.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        let mut next = *self;
        for (k, v) in patch {
            let n = parse_usize_range(v, k, 0, 1000)?;
            match k.as_str() {
                "minimum" => next.minimum = n,
                "comfortable" => next.comfortable = n,
                "optimal" => next.optimal = n,
                "high" => next.high = n,
                "maximum" => next.maximum = n,
                "maxParallelSections" => next.max_parallel_sections = n,
                _ => return Err(format!("unknown capacity field: {}", k)),
            }
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeSequence {
    pub sequence: Vec<Grade>,
}

impl Default for GradeSequence {
    fn default() -> Self {
        Self {
            sequence: vec![Grade::new("7"), Grade::new("8"), Grade::new("9")],
        }
    }
}

impl GradeSequence {
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        for (k, v) in patch {
            match k.as_str() {
                "sequence" => {
                    let arr = v
                        .as_array()
                        .ok_or_else(|| "sequence must be an array".to_string())?;
                    let mut out: Vec<Grade> = Vec::with_capacity(arr.len());
                    for item in arr {
                        let label = parse_string_max(item, "sequence item", 16)?;
                        if label.is_empty() {
                            return Err("grade labels must not be empty".into());
                        }
                        if out.iter().any(|g| g.as_str() == label) {
                            return Err(format!("grade {} appears twice", label));
                        }
                        out.push(Grade::new(label));
                    }
                    if out.len() < 2 {
                        return Err("sequence needs at least two grades".into());
                    }
                    self.sequence = out;
                }
                _ => return Err(format!("unknown grades field: {}", k)),
            }
        }
        Ok(())
    }

    fn to_value(&self) -> Value {
        json!({ "sequence": self.sequence.iter().map(|g| g.as_str()).collect::<Vec<_>>() })
    }
}

/// An academic year written `YYYY/YYYY`, e.g. `2024/2025`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcademicYear {
    pub start: i32,
    pub end: i32,
}

impl AcademicYear {
    pub fn parse(s: &str) -> Option<Self> {
        let (a, b) = s.trim().split_once('/')?;
        let start = a.trim().parse::<i32>().ok()?;
        let end = b.trim().parse::<i32>().ok()?;
        if end != start + 1 || !(1900..=9998).contains(&start) {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn next(self) -> Self {
        Self {
            start: self.end,
            end: self.end + 1,
        }
    }

    /// The year that is running on `today`, given the month the school year starts.
    pub fn containing(today: chrono::NaiveDate, start_month: u32) -> Self {
        use chrono::Datelike;
        let start = if today.month() >= start_month {
            today.year()
        } else {
            today.year() - 1
        };
        Self {
            start,
            end: start + 1,
        }
    }

    pub fn label(self) -> String {
        format!("{}/{}", self.start, self.end)
    }
}

fn parse_usize_range(v: &Value, key: &str, min: u64, max: u64) -> Result<usize, String> {
    let n = v
        .as_u64()
        .ok_or_else(|| format!("{} must be a non-negative integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n as usize)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

pub fn load_capacity(conn: &Connection) -> anyhow::Result<CapacityThresholds> {
    let mut current = CapacityThresholds::default();
    if let Some(saved) = db::settings_get_json(conn, CAPACITY_KEY)? {
        if let Some(obj) = saved.as_object() {
            // Malformed historical values fall back to defaults rather than block planning.
            if let Err(e) = current.apply_patch(obj) {
                tracing::warn!(error = %e, "ignoring saved capacity settings");
            }
        }
    }
    Ok(current)
}

pub fn save_capacity(conn: &Connection, thresholds: &CapacityThresholds) -> anyhow::Result<()> {
    db::settings_set_json(conn, CAPACITY_KEY, &thresholds.to_value())
}

pub fn load_grades(conn: &Connection) -> anyhow::Result<GradeSequence> {
    let mut current = GradeSequence::default();
    if let Some(saved) = db::settings_get_json(conn, GRADES_KEY)? {
        if let Some(obj) = saved.as_object() {
            if let Err(e) = current.apply_patch(obj) {
                tracing::warn!(error = %e, "ignoring saved grade sequence");
            }
        }
    }
    Ok(current)
}

pub fn save_grades(conn: &Connection, grades: &GradeSequence) -> anyhow::Result<()> {
    db::settings_set_json(conn, GRADES_KEY, &grades.to_value())
}

pub fn load_current_year(conn: &Connection) -> anyhow::Result<Option<String>> {
    Ok(db::settings_get_json(conn, CURRENT_YEAR_KEY)?
        .and_then(|v| v.as_str().map(|s| s.to_string())))
}

pub fn save_current_year(conn: &Connection, year: &str) -> anyhow::Result<()> {
    db::settings_set_json(conn, CURRENT_YEAR_KEY, &Value::String(year.to_string()))
}
