//! Expansion of range specs into object names.
//!
//! A range spec is either a brace template such as `shard-{0001..0100}.bin` (with an optional
//! step, `{0..100..10}`), or, with no braces at all, a plain object name prefix.

use anyhow::{bail, Result};

use crate::error::AppError;

/// A parsed range spec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RangeSpec {
    Template(Template),
    /// Matches all objects whose names start with the given prefix.
    Prefix(String),
}

/// A brace template expanding to a sequence of zero padded numeric names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    prefix: String,
    suffix: String,
    start: u64,
    end: u64,
    step: u64,
    /// Numbers are left padded with zeros to this width.
    width: usize,
}

impl Template {
    /// Iterate over the names generated by this template, in ascending order.
    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        (self.start..=self.end)
            .step_by(self.step as usize)
            .map(move |num| format!("{}{:0width$}{}", self.prefix, num, self.suffix, width = self.width))
    }

    /// The number of names generated by this template, saturating at `u64::MAX`.
    pub fn num_names(&self) -> u64 {
        ((self.end - self.start) / self.step).saturating_add(1)
    }
}

/// Parse the given range spec.
pub fn parse(raw: &str) -> Result<RangeSpec> {
    let (open, close) = (raw.find('{'), raw.find('}'));
    let (open, close) = match (open, close) {
        (None, None) => return Ok(RangeSpec::Prefix(raw.to_string())),
        (Some(open), Some(close)) if open < close => (open, close),
        _ => bail!(invalid(raw, "unbalanced braces")),
    };
    let (prefix, body, suffix) = (&raw[..open], &raw[open + 1..close], &raw[close + 1..]);
    if suffix.contains(|c| c == '{' || c == '}') || prefix.contains('}') {
        bail!(invalid(raw, "only a single brace range is supported"));
    }

    let parts: Vec<&str> = body.split("..").collect();
    let (start_raw, end_raw, step_raw) = match parts.as_slice() {
        [start, end] => (*start, *end, None),
        [start, end, step] => (*start, *end, Some(*step)),
        _ => bail!(invalid(raw, "expected `{start..end}` or `{start..end..step}`")),
    };
    let start = parse_num(raw, start_raw)?;
    let end = parse_num(raw, end_raw)?;
    let step = match step_raw {
        Some(step) => parse_num(raw, step)?,
        None => 1,
    };
    if start > end {
        bail!(invalid(raw, "range start is greater than its end"));
    }
    if step == 0 {
        bail!(invalid(raw, "range step may not be zero"));
    }
    Ok(RangeSpec::Template(Template {
        prefix: prefix.into(),
        suffix: suffix.into(),
        start,
        end,
        step,
        width: start_raw.len(),
    }))
}

fn parse_num(raw: &str, num: &str) -> Result<u64> {
    if num.is_empty() || !num.bytes().all(|b| b.is_ascii_digit()) {
        bail!(invalid(raw, "range bounds must be non-negative integers"));
    }
    match num.parse() {
        Ok(val) => Ok(val),
        Err(_) => bail!(invalid(raw, "range bound out of bounds")),
    }
}

fn invalid(raw: &str, reason: &str) -> AppError {
    AppError::InvalidInput(format!("invalid range spec {}: {}", raw, reason))
}
