//! `{{placeholder}}` substitution for player-facing messages.

use std::time::SystemTime;

pub const USERNAME: &str = "username";
pub const SERVER_DOMAIN: &str = "serverDomain";
pub const GATEWAY_ID: &str = "gatewayId";
pub const REMOTE_ADDRESS: &str = "remoteAddress";
pub const LOCAL_ADDRESS: &str = "localAddress";
pub const REQUESTED_ADDRESS: &str = "requestedAddress";
pub const MATCHED_ADDRESS: &str = "matchedAddress";
pub const PROTOCOL_NUMBER: &str = "protocolNumber";
pub const SERVER_ID: &str = "serverId";
pub const NOW: &str = "now";
pub const CURRENT_TIME: &str = "currentTime";

/// Values available to a template. Unknown placeholders render unchanged.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: Vec<(&'static str, String)>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &'static str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((key, value)),
        }
        self
    }

    /// Adds `{{now}}` (RFC 3339, UTC, seconds) and `{{currentTime}}`.
    pub fn with_time(self, now: SystemTime) -> Self {
        let rfc3339 = humantime::format_rfc3339_seconds(now).to_string();
        let human = format!("{} UTC", rfc3339.trim_end_matches('Z').replacen('T', " ", 1));
        self.set(NOW, rfc3339).set(CURRENT_TIME, human)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn render(&self, msg: &str) -> String {
        let mut out = String::with_capacity(msg.len());
        let mut rest = msg;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };
            let key = after[..end].trim();
            match self.get(key) {
                Some(v) => out.push_str(v),
                None => out.push_str(&rest[start..start + 2 + end + 2]),
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn new_year_2024() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_704_067_200)
    }

    #[test]
    fn dial_timeout_message() {
        let vars = TemplateVars::new()
            .set(SERVER_DOMAIN, "mc")
            .with_time(new_year_2024());
        assert_eq!(
            vars.render("server '{{serverDomain}}' offline (tried {{now}})"),
            "server 'mc' offline (tried 2024-01-01T00:00:00Z)"
        );
        assert_eq!(vars.render("{{currentTime}}"), "2024-01-01 00:00:00 UTC");
    }

    #[test]
    fn unknown_and_unterminated_placeholders_stay() {
        let vars = TemplateVars::new().set(USERNAME, "Notch");
        assert_eq!(
            vars.render("hi {{ username }}, {{nope}} {{username"),
            "hi Notch, {{nope}} {{username"
        );
        assert_eq!(vars.render("plain"), "plain");
    }

    #[test]
    fn later_set_overrides() {
        let vars = TemplateVars::new().set(GATEWAY_ID, "a").set(GATEWAY_ID, "b");
        assert_eq!(vars.render("{{gatewayId}}"), "b");
    }
}
