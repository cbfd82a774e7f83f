//! Five-field cron expressions with `|` separated alternatives.
//!
//! Expressions use the POSIX layout `minute hour day-of-month month
//! day-of-week`, evaluated in local time. Day-of-week accepts `0`-`7` (both
//! `0` and `7` are Sunday), three-letter names, ranges, lists and steps.
//!
//! Each alternative is translated into the seconds-first form understood by
//! the `cron` crate. When both day fields are restricted, POSIX cron fires
//! when *either* matches, so such an alternative becomes two schedules.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};

use crate::{Error, Result};

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed schedule. Fires at the earliest time any alternative matches.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedules: Vec<cron::Schedule>,
}

impl CronSchedule {
    /// Parse an expression such as `0 3 * * *` or `0 3 * * 1-5|0 12 * * 0,6`.
    pub fn parse(expression: &str) -> Result<Self> {
        let mut schedules = Vec::new();

        for alternative in expression.split('|') {
            for translated in translate(alternative).map_err(|e| Error::schedule(expression, e))? {
                let schedule = cron::Schedule::from_str(&translated)
                    .map_err(|e| Error::schedule(expression, e.to_string()))?;
                schedules.push(schedule);
            }
        }

        Ok(Self {
            expression: expression.to_string(),
            schedules,
        })
    }

    /// The expression as given.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The next fire time strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Local>) -> Option<DateTime<Local>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression)
            .finish()
    }
}

impl FromStr for CronSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Translate one POSIX alternative into one or two `cron` crate expressions.
fn translate(alternative: &str) -> std::result::Result<Vec<String>, String> {
    let fields: Vec<&str> = alternative.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!(
            "expected 5 fields in '{}', found {}",
            alternative.trim(),
            fields.len()
        ));
    }

    let (minute, hour, dom, month, dow) = (fields[0], fields[1], fields[2], fields[3], fields[4]);
    let days = day_of_week(dow)?;

    let dom_restricted = dom != "*";
    let dow_restricted = dow != "*";

    let expr = |dom: &str, dow: &str| format!("0 {minute} {hour} {dom} {month} {dow}");
    Ok(if dom_restricted && dow_restricted {
        vec![expr(dom, "*"), expr("*", &days)]
    } else {
        vec![expr(dom, &days)]
    })
}

/// Normalize a day-of-week field into a list of day names.
fn day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" {
        return Ok("*".to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in day-of-week"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (day_number(a)?, day_number(b)?)
        } else {
            let day = day_number(range)?;
            // `5/2` means from Friday through the end of the week.
            (day, if step > 1 { 7 } else { day })
        };

        if start > end {
            return Err(format!("invalid day-of-week range '{range}'"));
        }

        days.extend((start..=end).step_by(step).map(|day| day % 7));
    }

    Ok(days
        .into_iter()
        .map(|day| DAY_NAMES[day])
        .collect::<Vec<_>>()
        .join(","))
}

fn day_number(token: &str) -> std::result::Result<usize, String> {
    if let Ok(n) = token.parse::<usize>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day-of-week {n} out of range 0-7"))
        };
    }

    DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .ok_or_else(|| format!("unknown day-of-week '{token}'"))
}
