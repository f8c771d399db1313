//! MQTT topic filter matching.
//!
//! `+` matches exactly one level and `#` (last level only) matches the
//! remainder, including the parent level itself (`a/#` matches `a`).
//! Topics starting with `$` are not matched by a leading wildcard.

/// Values captured by the wildcard levels of a filter, in filter order.
///
/// A `#` capture is the remaining levels joined with `/` (empty when `#`
/// matched the parent level).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicMatch {
    pub captures: Vec<String>,
}

impl TopicMatch {
    /// Value of the last wildcard level of the filter.
    pub fn last_wildcard(&self) -> Option<&str> {
        self.captures.last().map(String::as_str)
    }
}

/// Check that a subscription filter is well formed.
pub fn validate_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("topic filter must not be empty".to_string());
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(format!("'#' must be the whole last level in '{}'", filter));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!("'+' must occupy a whole level in '{}'", filter));
        }
    }
    Ok(())
}

/// Match `topic` against `filter`, returning wildcard captures on success.
pub fn match_filter(filter: &str, topic: &str) -> Option<TopicMatch> {
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    if topic.starts_with('$') && matches!(filter_parts.first(), Some(&"+") | Some(&"#")) {
        return None;
    }

    let mut captures = Vec::new();
    for (i, pattern) in filter_parts.iter().enumerate() {
        match *pattern {
            "#" => {
                captures.push(topic_parts.get(i..).map(|rest| rest.join("/")).unwrap_or_default());
                return Some(TopicMatch { captures });
            }
            "+" => {
                let level = topic_parts.get(i)?;
                captures.push(level.to_string());
            }
            literal => {
                if topic_parts.get(i) != Some(&literal) {
                    return None;
                }
            }
        }
    }

    if filter_parts.len() == topic_parts.len() {
        Some(TopicMatch { captures })
    } else {
        None
    }
}

/// Whether `topic` satisfies `filter`.
pub fn matches(filter: &str, topic: &str) -> bool {
    match_filter(filter, topic).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches("home/kitchen/power", "home/kitchen/power"));
        assert!(!matches("home/kitchen/power", "home/kitchen"));
        assert!(!matches("home/kitchen", "home/kitchen/power"));
    }

    #[test]
    fn test_single_level_wildcard() {
        let m = match_filter("home/+/power", "home/kitchen/power").unwrap();
        assert_eq!(m.captures, vec!["kitchen"]);
        assert!(!matches("home/+/power", "home/kitchen/sub/power"));
        assert!(!matches("home/+", "home"));
        assert!(matches("home/+", "home/"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        let m = match_filter("home/#", "home/kitchen/power").unwrap();
        assert_eq!(m.last_wildcard(), Some("kitchen/power"));
        assert!(matches("home/#", "home"));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("home/#", "office/kitchen"));
    }

    #[test]
    fn test_last_wildcard_segment() {
        let m = match_filter(
            "shellies/+/emeter/+/hourly-energy",
            "shellies/devA/emeter/0/hourly-energy",
        )
        .unwrap();
        assert_eq!(m.captures, vec!["devA", "0"]);
        assert_eq!(m.last_wildcard(), Some("0"));

        assert_eq!(match_filter("a/b", "a/b").unwrap().last_wildcard(), None);
    }

    #[test]
    fn test_system_topics_skip_leading_wildcards() {
        assert!(!matches("#", "$SYS/broker/uptime"));
        assert!(!matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter("a/+/b/#").is_ok());
        assert!(validate_filter("#").is_ok());
        assert!(validate_filter("").is_err());
        assert!(validate_filter("a/#/b").is_err());
        assert!(validate_filter("a/b#").is_err());
        assert!(validate_filter("a/b+/c").is_err());
    }
}
