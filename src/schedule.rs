//! Weekly rate schedule: parses a declarative schedule file and answers
//! "which block is active, and when is the next transition".

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Local, NaiveTime, TimeZone, Weekday};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("malformed line {line_no}: {line}")]
    MalformedLine { line_no: usize, line: String },

    #[error("unknown weekday {0:?}")]
    UnknownWeekday(String),

    #[error("end time must be strictly greater than start time on line {line_no}: {line}")]
    NonIncreasingRange { line_no: usize, line: String },

    #[error("invalid rate {0:?}")]
    InvalidRate(String),

    #[error("time ranges are not allowed to overlap")]
    OverlappingRanges,

    #[error("schedule must contain at least one block")]
    NoBlocks,
}

/// A `(weekday, [startMinuteOfDay, endMinuteOfDay), rate)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleBlock {
    pub weekday: Weekday,
    pub start_minute: u32,
    pub end_minute: u32,
    pub rate: u64,
}

impl ScheduleBlock {
    fn sort_key(&self) -> (u8, u32) {
        (weekday_index(self.weekday), self.start_minute)
    }
}

fn weekday_index(day: Weekday) -> u8 {
    day.num_days_from_monday() as u8
}

/// A default rate plus a set of non-overlapping weekly blocks.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub default_rate: u64,
    pub blocks: Vec<ScheduleBlock>,
}

impl Schedule {
    pub fn parse(contents: &str) -> Result<Self, ScheduleError> {
        let mut default_rate = 0u64;
        let mut blocks = Vec::new();

        for (idx, raw_line) in contents.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("default:") {
                default_rate = parse_rate(rest.trim())?;
                continue;
            }
            blocks.extend(parse_block_line(line, line_no)?);
        }

        if blocks.is_empty() {
            return Err(ScheduleError::NoBlocks);
        }

        blocks.sort_by_key(|b| b.sort_key());
        check_no_overlap(&blocks)?;

        Ok(Schedule {
            default_rate,
            blocks,
        })
    }

    /// The block whose next occurrence starts soonest from `now`, along
    /// with that occurrence's concrete start/end instants. Ties are
    /// broken by the blocks' sort order (weekday, start).
    pub fn next(&self, now: DateTime<Local>) -> Option<(ScheduleBlock, DateTime<Local>, DateTime<Local>)> {
        self.blocks
            .iter()
            .map(|block| {
                let (start, end) = occurrence(*block, now);
                (*block, start, end)
            })
            .min_by_key(|(_, start, _)| *start)
    }

    /// The rate in effect right now: a block's rate if `now` falls
    /// inside its current/most-recent occurrence, else the default.
    pub fn active_rate(&self, now: DateTime<Local>) -> u64 {
        for block in &self.blocks {
            let (start, end) = current_or_most_recent_occurrence(*block, now);
            if now >= start && now < end {
                return block.rate;
            }
        }
        self.default_rate
    }
}

/// `true` iff `now` is inside this block's next upcoming occurrence's
/// span (spec's `active()` query, restricted to the soonest instance).
pub fn block_active(block: ScheduleBlock, now: DateTime<Local>) -> bool {
    let (start, end) = occurrence(block, now);
    now >= start && now < end
}

fn occurrence(block: ScheduleBlock, now: DateTime<Local>) -> (DateTime<Local>, DateTime<Local>) {
    let mut candidate_date = now.date_naive();
    loop {
        if candidate_date.weekday() == block.weekday {
            let start = local_at(candidate_date, block.start_minute);
            let mut end = local_at(candidate_date, block.end_minute);
            if end < start {
                end += Duration::hours(1);
            }
            if end >= now {
                return (start, end);
            }
        }
        candidate_date = candidate_date.succ_opt().expect("date overflow");
        if candidate_date > now.date_naive() + Duration::days(8) {
            let start = local_at(candidate_date, block.start_minute);
            let mut end = local_at(candidate_date, block.end_minute);
            if end < start {
                end += Duration::hours(1);
            }
            return (start, end);
        }
    }
}

fn current_or_most_recent_occurrence(
    block: ScheduleBlock,
    now: DateTime<Local>,
) -> (DateTime<Local>, DateTime<Local>) {
    for back in 0..8 {
        let candidate_date = now.date_naive() - Duration::days(back);
        if candidate_date.weekday() == block.weekday {
            let start = local_at(candidate_date, block.start_minute);
            let mut end = local_at(candidate_date, block.end_minute);
            if end < start {
                end += Duration::hours(1);
            }
            return (start, end);
        }
    }
    occurrence(block, now)
}

fn local_at(date: chrono::NaiveDate, minute_of_day: u32) -> DateTime<Local> {
    let time = NaiveTime::from_hms_opt(minute_of_day / 60, minute_of_day % 60, 0)
        .expect("minute_of_day in range");
    let naive = date.and_time(time);
    match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(a, _) => a,
        chrono::LocalResult::None => {
            Local.from_local_datetime(&naive.checked_add_signed(Duration::hours(1)).unwrap())
                .single()
                .expect("post-DST-gap time resolves")
        }
    }
}

fn check_no_overlap(blocks: &[ScheduleBlock]) -> Result<(), ScheduleError> {
    let mut by_day: HashMap<u8, Vec<&ScheduleBlock>> = HashMap::new();
    for block in blocks {
        by_day.entry(weekday_index(block.weekday)).or_default().push(block);
    }
    for same_day in by_day.values() {
        let mut sorted: Vec<&&ScheduleBlock> = same_day.iter().collect();
        sorted.sort_by_key(|b| b.start_minute);
        for pair in sorted.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.end_minute > b.start_minute {
                return Err(ScheduleError::OverlappingRanges);
            }
        }
    }
    Ok(())
}

fn parse_block_line(line: &str, line_no: usize) -> Result<Vec<ScheduleBlock>, ScheduleError> {
    let (days_part, rest) = line.split_once(char::is_whitespace).ok_or_else(|| {
        ScheduleError::MalformedLine {
            line_no,
            line: line.to_string(),
        }
    })?;
    let rest = rest.trim();
    let (time_part, rate_part) = rest.split_once(':').ok_or_else(|| ScheduleError::MalformedLine {
        line_no,
        line: line.to_string(),
    })?;
    let time_part = time_part.trim();
    let rate = parse_rate(rate_part.trim())?;

    let (start_str, end_str) = time_part.split_once('-').ok_or_else(|| ScheduleError::MalformedLine {
        line_no,
        line: line.to_string(),
    })?;
    let start_minute = parse_hhmm(start_str, line_no, line)?;
    let end_minute = parse_hhmm(end_str, line_no, line)?;
    if end_minute <= start_minute {
        return Err(ScheduleError::NonIncreasingRange {
            line_no,
            line: line.to_string(),
        });
    }

    let days = parse_day_range(days_part, line_no, line)?;
    Ok(days
        .into_iter()
        .map(|weekday| ScheduleBlock {
            weekday,
            start_minute,
            end_minute,
            rate,
        })
        .collect())
}

fn parse_hhmm(s: &str, line_no: usize, line: &str) -> Result<u32, ScheduleError> {
    if s.len() != 4 || !s.chars().all(|c| c.is_ascii_digit()) {
        return Err(ScheduleError::MalformedLine {
            line_no,
            line: line.to_string(),
        });
    }
    let hour: u32 = s[0..2].parse().map_err(|_| ScheduleError::MalformedLine {
        line_no,
        line: line.to_string(),
    })?;
    let minute: u32 = s[2..4].parse().map_err(|_| ScheduleError::MalformedLine {
        line_no,
        line: line.to_string(),
    })?;
    if hour > 23 || minute > 59 {
        return Err(ScheduleError::MalformedLine {
            line_no,
            line: line.to_string(),
        });
    }
    Ok(hour * 60 + minute)
}

fn parse_weekday(s: &str) -> Result<Weekday, ScheduleError> {
    let lower = s.to_ascii_lowercase();
    let day = match lower.as_str() {
        "mon" | "monday" => Weekday::Mon,
        "tue" | "tuesday" => Weekday::Tue,
        "wed" | "wednesday" => Weekday::Wed,
        "thu" | "thursday" => Weekday::Thu,
        "fri" | "friday" => Weekday::Fri,
        "sat" | "saturday" => Weekday::Sat,
        "sun" | "sunday" => Weekday::Sun,
        _ => return Err(ScheduleError::UnknownWeekday(s.to_string())),
    };
    Ok(day)
}

fn parse_day_range(s: &str, line_no: usize, line: &str) -> Result<Vec<Weekday>, ScheduleError> {
    if let Some((start, end)) = s.split_once('-') {
        let start_day = parse_weekday(start)?;
        let end_day = parse_weekday(end)?;
        let mut days = Vec::new();
        let mut cur = start_day;
        loop {
            days.push(cur);
            if cur == end_day {
                break;
            }
            cur = cur.succ();
            if days.len() > 7 {
                return Err(ScheduleError::MalformedLine {
                    line_no,
                    line: line.to_string(),
                });
            }
        }
        Ok(days)
    } else {
        Ok(vec![parse_weekday(s)?])
    }
}

/// Parse `unlimited` or a decimal with optional `k/K`, `m/M`, `g/G`
/// suffix, rounded to an integer byte-per-second value.
pub fn parse_rate(s: &str) -> Result<u64, ScheduleError> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("unlimited") {
        return Ok(0);
    }
    let (digits, multiplier) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1_000.0),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1_000_000.0),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1_000_000_000.0),
        _ => (s, 1.0),
    };
    let value: f64 = f64::from_str(digits).map_err(|_| ScheduleError::InvalidRate(s.to_string()))?;
    if value < 0.0 {
        return Err(ScheduleError::InvalidRate(s.to_string()));
    }
    Ok((value * multiplier).round() as u64)
}

/// Format a rate the way `parse_rate` expects to read it back: bare
/// integer below 1000, else the largest suffix that keeps at least one
/// significant digit before the decimal point.
pub fn format_rate(rate: u64) -> String {
    if rate == 0 {
        return "unlimited".to_string();
    }
    if rate >= 1_000_000_000 && rate % 1_000_000_000 == 0 {
        format!("{}g", rate / 1_000_000_000)
    } else if rate >= 1_000_000 && rate % 1_000_000 == 0 {
        format!("{}m", rate / 1_000_000)
    } else if rate >= 1_000 && rate % 1_000 == 0 {
        format!("{}k", rate / 1_000)
    } else {
        rate.to_string()
    }
}
