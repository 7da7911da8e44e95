//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must be the last level
//! - Single-level wildcard (+) must occupy entire level
//! - Topics starting with $ are not matched by filters starting with a wildcard

/// Validate a topic name (used in PUBLISH)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let levels: Vec<&str> = filter.split('/').collect();

    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i != levels.len() - 1 {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && *level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// Matching rules:
/// - / is the level separator
/// - + matches exactly one level
/// - # matches zero or more levels (must be last)
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');

    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }

        match topic_levels.next() {
            Some(_) if filter_level == "+" => {}
            Some(level) if level == filter_level => {}
            _ => return false,
        }
    }

    // Both must be exhausted for a match
    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test").is_ok());
        assert!(validate_topic_name("/gowon/input").is_ok());
        assert!(validate_topic_name("test/topic/").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("test+topic").is_err());
        assert!(validate_topic_name("test/#").is_err());
        assert!(validate_topic_name("nul\0byte").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("/gowon/output").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("test/+/topic").is_ok());
        assert!(validate_topic_filter("test/#").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("test+").is_err());
        assert!(validate_topic_filter("test#").is_err());
        assert!(validate_topic_filter("test/#/more").is_err());
    }

    #[test_case("/gowon/output", "/gowon/output", true ; "exact")]
    #[test_case("/gowon/output", "/gowon/input", false ; "different leaf")]
    #[test_case("/gowon/output", "/gowon/+", true ; "single level wildcard")]
    #[test_case("/gowon/output", "+/gowon/output", true ; "leading empty level")]
    #[test_case("/gowon/output", "/gowon/#", true ; "multi level wildcard")]
    #[test_case("/gowon", "/gowon/#", true ; "hash matches parent")]
    #[test_case("a/b/c", "a/+", false ; "plus matches one level only")]
    #[test_case("a", "a/b", false ; "filter longer than topic")]
    #[test_case("a/b", "a", false ; "topic longer than filter")]
    #[test_case("$SYS/uptime", "#", false ; "dollar topic hidden from hash")]
    #[test_case("$SYS/uptime", "+/uptime", false ; "dollar topic hidden from plus")]
    #[test_case("$SYS/uptime", "$SYS/#", true ; "dollar topic explicit")]
    fn test_topic_matches(topic: &str, filter: &str, expected: bool) {
        assert_eq!(topic_matches_filter(topic, filter), expected);
    }
}
