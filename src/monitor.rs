/// Diagnostic health levels for the monitoring endpoint.
use std::cmp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Ok = 0,
    Warning = 1,
    Critical = 2,
}

#[derive(Debug, Clone)]
pub struct Status {
    level: Level,
    messages: Vec<String>,
}

impl Status {
    pub fn ok() -> Status {
        Status { level: Level::Ok, messages: Vec::new() }
    }

    pub fn warning(msg: String) -> Status {
        Status { level: Level::Warning, messages: vec![msg] }
    }

    pub fn critical(msg: String) -> Status {
        Status { level: Level::Critical, messages: vec![msg] }
    }

    /// Critical without a reason line; used when the reasons were already
    /// merged in one by one.
    pub fn critical_silent() -> Status {
        Status { level: Level::Critical, messages: Vec::new() }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn merge(&mut self, other: Status) -> &mut Status {
        self.level = cmp::max(self.level, other.level);
        self.messages.extend(other.messages);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_takes_worst_level_and_all_messages() {
        let mut s = Status::ok();
        s.merge(Status::warning("b1 is dead".into()));
        assert_eq!(s.level(), Level::Warning);
        s.merge(Status::critical("no primary".into()));
        assert_eq!(s.level(), Level::Critical);
        s.merge(Status::ok());
        assert_eq!(s.level(), Level::Critical);
        assert_eq!(s.messages(), ["b1 is dead", "no primary"]);
    }
}
