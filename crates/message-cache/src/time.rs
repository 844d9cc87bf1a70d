use chrono::NaiveTime;
use tracing::debug;

/// Parses a chat-list time label such as `3:45 p. m.`, `11:02 AM` or `15:45`.
///
/// Unparsable labels ("ayer", weekday names) fall back to midnight.
pub fn parse_chat_time(text: &str) -> NaiveTime {
    try_parse_chat_time(text).unwrap_or_else(|| {
        debug!(target: "message-cache", text, "unparsable chat time; using midnight");
        NaiveTime::MIN
    })
}

pub fn try_parse_chat_time(text: &str) -> Option<NaiveTime> {
    let compact: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '.')
        .flat_map(char::to_lowercase)
        .collect();

    let (clock, meridiem) = if let Some(clock) = compact.strip_suffix("am") {
        (clock, Some(false))
    } else if let Some(clock) = compact.strip_suffix("pm") {
        (clock, Some(true))
    } else {
        (compact.as_str(), None)
    };

    let mut parts = clock.split(':');
    let hour: u32 = parts.next()?.parse().ok()?;
    let minute: u32 = parts.next()?.parse().ok()?;
    let second: u32 = match parts.next() {
        Some(raw) => raw.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }

    let hour = match meridiem {
        Some(pm) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            match (pm, hour) {
                (false, 12) => 0,
                (true, 12) => 12,
                (true, h) => h + 12,
                (false, h) => h,
            }
        }
        None => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn normalizes_meridiem_tokens() {
        assert_eq!(parse_chat_time("3:45 p. m."), hm(15, 45));
        assert_eq!(parse_chat_time("3:45 p.m."), hm(15, 45));
        assert_eq!(parse_chat_time("3:45 PM"), hm(15, 45));
        assert_eq!(parse_chat_time("3:45\u{202f}pm"), hm(15, 45));
        assert_eq!(parse_chat_time("9:05 a.\u{a0}m."), hm(9, 5));
    }

    #[test]
    fn noon_and_midnight_edges() {
        assert_eq!(parse_chat_time("12:00 a. m."), hm(0, 0));
        assert_eq!(parse_chat_time("12:30 p. m."), hm(12, 30));
    }

    #[test]
    fn accepts_24_hour_labels() {
        assert_eq!(parse_chat_time("15:45"), hm(15, 45));
        assert_eq!(parse_chat_time("07:10:30"), NaiveTime::from_hms_opt(7, 10, 30).unwrap());
    }

    #[test]
    fn falls_back_to_midnight() {
        assert_eq!(parse_chat_time("ayer"), NaiveTime::MIN);
        assert_eq!(parse_chat_time(""), NaiveTime::MIN);
        assert_eq!(parse_chat_time("13:00 p. m."), NaiveTime::MIN);
        assert_eq!(parse_chat_time("25:00"), NaiveTime::MIN);
        assert!(try_parse_chat_time("lunes").is_none());
    }
}
