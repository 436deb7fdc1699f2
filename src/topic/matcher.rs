//! Topic filter matching and validation
//!
//! Rules:
//! - `/` separates levels; empty levels are legal (`/a`, `a//b`)
//! - `+` must be a whole level and matches exactly one level
//! - `#` must be the whole last level and matches its parent level and
//!   everything below it
//! - Topics whose first level starts with `$` are not matched by a filter
//!   starting with a wildcard
//!
//! Validation happens when a filter is subscribed; `matches` assumes a
//! valid filter and never fails.

/// Maximum encoded length of a topic name or filter
const MAX_TOPIC_LEN: usize = 65_535;

/// Whether `topic` is selected by `filter`
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(level) if filter_level == "+" || filter_level == level => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

/// Validate a topic name used in PUBLISH
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    validate_topic_name_with_max_levels(topic, 0)
}

/// Validate a topic name, also capping its level count (0 = unlimited)
pub fn validate_topic_name_with_max_levels(
    topic: &str,
    max_topic_levels: usize,
) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }
    if exceeds_levels(topic, max_topic_levels) {
        return Err("topic exceeds maximum allowed levels");
    }
    Ok(())
}

/// Validate a topic filter used in SUBSCRIBE / UNSUBSCRIBE
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    validate_topic_filter_with_max_levels(filter, 0)
}

/// Validate a topic filter, also capping its level count (0 = unlimited)
pub fn validate_topic_filter_with_max_levels(
    filter: &str,
    max_topic_levels: usize,
) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }
    if exceeds_levels(filter, max_topic_levels) {
        return Err("topic filter exceeds maximum allowed levels");
    }
    Ok(())
}

fn exceeds_levels(topic: &str, max_topic_levels: usize) -> bool {
    max_topic_levels > 0 && topic.split('/').count() > max_topic_levels
}

/// Whether a filter contains `+` or `#`
pub fn has_wildcards(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}
