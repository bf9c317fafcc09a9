//! Topic name and topic filter rules.

/// Checks a topic name used in PUBLISH: non-empty, no wildcards, no NUL.
pub fn validate_topic(topic: &str) -> Result<(), crate::Error> {
    if topic.is_empty() || topic.len() > u16::MAX as usize {
        return Err(crate::Error::InvalidTopic);
    }

    if topic.contains(['+', '#', '\0']) {
        return Err(crate::Error::InvalidTopic);
    }

    Ok(())
}

/// Checks a subscription filter.
///
/// `#` must be the last level and occupy it alone; `+` must occupy a whole
/// level.
pub fn validate_filter(filter: &str) -> Result<(), crate::Error> {
    if filter.is_empty() || filter.len() > u16::MAX as usize || filter.contains('\0') {
        return Err(crate::Error::InvalidTopic);
    }

    let mut levels = filter.split('/').peekable();

    while let Some(level) = levels.next() {
        let last = levels.peek().is_none();

        match level {
            "#" if last => {}
            "+" => {}
            _ if level.contains(['+', '#']) => return Err(crate::Error::InvalidTopic),
            _ => {}
        }
    }

    Ok(())
}

/// Whether `topic` is matched by `filter`.
///
/// Topics starting with `$` are never matched by a filter whose first level
/// is a wildcard.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names() {
        assert!(validate_topic("sensors/humidity").is_ok());
        assert!(validate_topic("/").is_ok());
        assert_eq!(validate_topic(""), Err(crate::Error::InvalidTopic));
        assert_eq!(validate_topic("a/+"), Err(crate::Error::InvalidTopic));
        assert_eq!(validate_topic("a/#"), Err(crate::Error::InvalidTopic));
    }

    #[test]
    fn filters() {
        for ok in ["#", "+", "a/#", "a/+/c", "+/+", "/+", "a//b"] {
            assert!(validate_filter(ok).is_ok(), "{}", ok);
        }

        for bad in ["", "a/#/c", "a#", "a/b+", "#/", "a/+b"] {
            assert_eq!(validate_filter(bad), Err(crate::Error::InvalidTopic), "{}", bad);
        }
    }

    #[test]
    fn exact_match() {
        assert!(matches("a/b", "a/b"));
        assert!(!matches("a/b", "a/c"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(matches("sensors/+/temp", "sensors/kitchen/temp"));
        assert!(!matches("sensors/+/temp", "sensors/kitchen/hall/temp"));
        assert!(matches("+", "a"));
        assert!(!matches("+", "a/b"));
        assert!(matches("a/+", "a/"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(matches("#", "a/b/c"));
        assert!(matches("a/#", "a"));
        assert!(matches("a/#", "a/b/c"));
        assert!(!matches("a/#", "b/c"));
    }

    #[test]
    fn system_topics() {
        assert!(!matches("#", "$SYS/uptime"));
        assert!(!matches("+/uptime", "$SYS/uptime"));
        assert!(matches("$SYS/#", "$SYS/uptime"));
    }
}
